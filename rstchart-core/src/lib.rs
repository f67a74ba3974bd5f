//! # rstchart-core
//!
//! Statechart execution engine for rstchart.
//!
//! This crate provides:
//! - Chart description parsing and validation
//! - Transition selection and exit/entry planning
//! - Run-to-completion sessions with internal and external queues
//! - History, invocations and delayed sends
//! - A reference expression evaluator over JSON values

pub mod child;
pub mod configuration;
pub mod content;
pub mod definition;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod event;
mod exec;
pub mod expr;
pub mod history;
pub mod invoke;
pub mod planner;
pub mod queue;
pub mod scheduler;
pub mod selector;
pub mod session;
mod step;

pub use child::StatechartInvoker;
pub use configuration::ActiveConfiguration;
pub use definition::{Chart, ChartDocument, StateId, StateKind, TransitionId};
pub use engine::StatechartEngine;
pub use error::{CoreError, DispatchError, EvalError, InvokeError};
pub use evaluator::{EvalContext, Evaluator, EvaluatorFactory, SystemVariables};
pub use event::{Event, EventDescriptor, EventKind};
pub use expr::JsonEvaluator;
pub use invoke::{ChildOutput, ChildSession, InvocationStatus, InvokeRequest, Invoker};
pub use scheduler::{DelayedSendScheduler, ExternalTransport, ManualScheduler, ScheduledSend, SendTarget};
pub use session::{Session, SessionBuilder, SessionConfig, SessionSnapshot, SessionStatus};
