//! Director - cycle and budget control for the scientist loop
//!
//! ```text
//!            run(initial)
//!   Idle ─────────────────▶ Planning ──PLAN_APPROVED──▶ Executing
//!                             ▲  │                         │
//!                PLAN_REQUESTED  │ PLAN_REJECTED           │ batch complete,
//!                             │  │ (retries exhausted)     │ budget spent or
//!                             │  ▼                         ▼ cycle deadline
//!                             └──────── Analyzing ◀────────┘
//!                   INSIGHT_GENERATED     │
//!                   (budget + cycles left)│ INSIGHT_GENERATED / analysis deadline
//!                                         ▼ (stop condition)
//!                                     Terminated
//! ```
//!
//! [`state::CycleState`] holds the counters and decides; [`actor::DirectorActor`]
//! persists results, publishes, and arms the watchdog timers.

pub mod actor;
pub mod protocol;
pub mod state;

pub use actor::{
    director_status, run_director, DirectorActor, DirectorArguments, DIRECTOR_SENDER,
};
pub use protocol::{DeadlineStage, DirectorError, DirectorMsg, DirectorStatus, RunOutcome};
pub use state::{DirectorPolicy, Phase};
