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

//! Utility functions and helpers

pub mod logging;
pub mod uuid;

pub use self::uuid::*;

/// Size formatting used in selection logs and table dumps
pub mod to_string {
    /// Render a size boundary, printing the unbounded sentinel as `max`
    pub fn size_to_string(size: usize) -> String {
        if size == usize::MAX {
            "max".to_string()
        } else {
            size.to_string()
        }
    }
}
