//! Domain model (ids, state machine, task record, errors, events).

pub mod admission;
pub mod counts;
pub mod errors;
pub mod events;
pub mod group;
pub mod ids;
pub mod search;
pub mod state;
pub mod task;

pub use self::admission::{Candidate, admit};
pub use self::counts::TaskCounts;
pub use self::errors::{BoxError, ErrorKind, SchedulerError};
pub use self::events::TaskEvent;
pub use self::group::GroupKeyPattern;
pub use self::ids::{ScheduleId, TaskId};
pub use self::search::{DEFAULT_SEARCH_LIMIT, SearchParams};
pub use self::state::{StateTransition, TaskState};
pub use self::task::{ExpiryReason, Task, TaskProps};
