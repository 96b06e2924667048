//! # warden: a declarative configuration-management agent
//!
//! warden ingests a policy describing desired states — *promises* — for
//! files, packages, classes and variables, then evaluates those promises
//! against the host to bring it into compliance. Promises are idempotent
//! and convergent: re-running the agent on a compliant host changes
//! nothing.
//!
//! ## Pipeline
//!
//! ```text
//! Policy JSON → Policy model → Validator → Expander → Actuators → Outcomes
//! ```
//!
//! ### The policy model ([`policy`])
//! Bundles own sections of typed promises; bodies are reusable attribute
//! blocks referenced by name; everything is validated semantically by
//! [`policy::validate`] and round-trips through JSON via [`policy::json`].
//!
//! ### Evaluation ([`eval`])
//! The [`eval::EvalContext`] carries all run state: class heaps, variable
//! scopes, frames, regex match captures and abort flags. The class algebra
//! lives in [`eval::classes`], variable scoping and `$(x)` expansion in
//! [`eval::vars`], and lazy Cartesian-product promise expansion in
//! [`eval::expand`].
//!
//! ### Actuation
//! The [`runner::AgentRunner`] walks the bundle sequence and dispatches
//! each concrete promise: the convergent line editor ([`edit`]), the
//! change tracker ([`changes`]), and the out-of-process package module
//! protocol ([`package`]). Re-execution is throttled through named locks
//! ([`locks`]) shared with other agent processes via the state store
//! ([`store`]).
//!
//! ## Outcomes
//! Every actuation folds into a five-valued [`outcome::Outcome`]; a run
//! exits non-zero only when a promise failed outright. In dry-run mode
//! would-be repairs are applied in memory and reported, but nothing on the
//! host is touched.

pub mod changes;
pub mod config;
pub mod edit;
pub mod error;
pub mod eval;
pub mod locks;
pub mod outcome;
pub mod package;
pub mod policy;
pub mod runner;
pub mod store;

pub use config::RunConfig;
pub use error::{Result, WardenError};
pub use eval::EvalContext;
pub use outcome::Outcome;
pub use policy::Policy;
pub use runner::{AgentRunner, RunSummary};
