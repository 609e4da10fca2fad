// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! UUID utilities

use uuid::Uuid;

/// Generate a random UUID v4 without hyphens
pub fn generate_simple_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Name for a POSIX shared-memory object, unique per call unless `session` is given
///
/// Processes that must meet in the same segment pass the same session string.
pub fn shm_segment_name(prefix: &str, session: Option<&str>, group_id: usize) -> String {
    match session {
        Some(s) => format!("/{}-{}-{}", prefix, s, group_id),
        None => format!("/{}-{}-{}", prefix, generate_simple_uuid(), group_id),
    }
}
