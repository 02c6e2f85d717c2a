//! kubewasm-runtime — run scheduler guest modules as framework plugins.
//!
//! ```text
//! WasmPlugin::load / from_bytes
//!   ├── fetch      (file or HTTP(S) → module bytes)
//!   ├── prepare    (kubewasm-host: compile, validate, pre-link)
//!   ├── classify   (export set → interface groups)
//!   └── GuestPool
//!       ├── scheduled slot (cycle, pod uid, retention) → Guest
//!       ├── binding map    pod uid → Guest
//!       └── free list      Guest …
//! ```
//!
//! The resolved [`Interfaces`] value is what a scheduler registers: it
//! implements exactly the framework traits the guest's exports support.

pub mod error;
pub mod fetch;
pub mod guest;
pub mod plugin;
pub mod pool;
pub mod resolver;

pub use error::{GuestCallError, PluginError};
pub use guest::{Guest, PostFilterOutcome};
pub use plugin::{PoolStats, WasmPlugin};
pub use pool::{Claim, GuestFactory, GuestPool, PARKED_LIMIT, Pooled, Retention};
pub use resolver::{AsStages, GroupSet, Interfaces, ResolveError, classify};
