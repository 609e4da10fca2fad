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

//! Logging utilities
//!
//! The `log` crate with an env_logger backend. Filters come from
//! `CCL_LOG` (same syntax as `RUST_LOG`), so a job can raise the runtime's
//! verbosity without touching the application's own filter:
//! `CCL_LOG=ccl=debug` prints selected algorithms and selection tables,
//! `CCL_LOG=ccl=trace` adds table edits and per-entry progress.
//!
//! Every initializer is idempotent; later calls are no-ops.

use std::io::Write;

use env_logger::{Builder, Env};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "CCL_LOG";
/// Environment variable holding the color choice (`auto`, `always`, `never`)
pub const LOG_STYLE_ENV: &str = "CCL_LOG_STYLE";

fn builder() -> Builder {
    Builder::from_env(Env::new().filter(LOG_ENV).write_style(LOG_STYLE_ENV))
}

/// Initialize logging from `CCL_LOG`
pub fn init_logging() {
    let _ = builder().try_init();
}

/// Initialize logging at `level`, refined by `CCL_LOG` when set
pub fn init_logging_with_level(level: log::LevelFilter) {
    let mut builder = Builder::new();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var(LOG_ENV) {
        builder.parse_filters(&filters);
    }
    let _ = builder.try_init();
}

/// Initialize logging for one rank of a multi-process job
///
/// Lines carry the rank so interleaved output of a node can be told apart.
pub fn init_logging_for_rank(rank: usize, size: usize) {
    let _ = builder()
        .format(move |buf, record| {
            writeln!(
                buf,
                "[ccl {}/{} {} {}] {}",
                rank,
                size,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

#[macro_export]
macro_rules! ccl_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! ccl_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! ccl_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! ccl_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! ccl_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*)
    };
}
