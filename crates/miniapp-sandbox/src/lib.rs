//! Miniapp Sandbox - isolated execution of mini-app logic.
//!
//! Logic is written in [Rhai](https://rhai.rs) and evaluated by a hardened
//! engine: no module imports, no `eval`, and bounded operations, call depth
//! and value sizes. The only way out is the capability context:
//!
//! - `setData(map)`: shallow-merge into the app data and publish a snapshot
//! - `setTimeout` / `setInterval` / `clearTimeout` / `clearInterval`
//! - `console.log/info/warn/error`, `print`, `debug`
//! - `App(map)`: register initial data, lifecycle callbacks and methods
//! - `now()`: epoch milliseconds
//!
//! Every [`Sandbox`] runs on its own thread. Faults raised by the logic are
//! contained: they become [`MethodOutcome::Failed`](miniapp_bridge::MethodOutcome)
//! results and error-level log events, never host errors.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use miniapp_bridge::Bridge;
//! use miniapp_sandbox::{Sandbox, SandboxLimits};
//! use serde_json::Value;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = r"
//!     App(#{
//!         data: #{ count: 0 },
//!         increment: || { setData(#{ count: this.data.count + 1 }); }
//!     });
//! ";
//! let sandbox = Sandbox::spawn("counter", source, Arc::new(Bridge::new()), SandboxLimits::default()).await?;
//! sandbox.invoke_method("increment", Value::Null).await?;
//! assert_eq!(sandbox.snapshot()["count"], 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(unreachable_pub)]

pub mod prelude;

mod context;
mod engine;
mod error;
mod limits;
mod methods;
mod sandbox;
mod status;
mod timers;

pub use engine::LoadReport;
pub use error::{SandboxError, SandboxResult};
pub use limits::SandboxLimits;
pub use methods::Lifecycle;
pub use sandbox::Sandbox;
pub use status::SandboxState;
