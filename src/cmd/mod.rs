//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `fix`     | `Fix`            |
//! | `inspect` | `Inspect`        |

pub mod fix;
pub mod inspect;

pub use fix::{FixArgs, cmd_fix};
pub use inspect::cmd_inspect;
