//! Persistence and coordination core for a continuous-integration
//! buildmaster: schema bootstrap, a pooled/dedicated connection layer, and
//! the Change, SourceStamp, Scheduler, and BuildSet/BuildRequest stores built
//! on top of it.

pub mod buildsets;
pub mod cache;
pub mod changes;
pub mod clock;
pub mod connector;
pub mod error;
pub mod notify;
pub mod results;
pub mod schedulers;
pub mod schema;
pub mod sourcestamps;
pub mod url;

pub use buildsets::{BuildInfo, BuildRequestRow, BuildSetInfo, NewBuildSet, RequestedBuild};
pub use cache::BoundedCache;
pub use changes::{Change, ChangeFilter, NewChange, PropertyValue};
pub use clock::{Clock, SystemClock};
pub use connector::{Bind, Connector, Txn};
pub use error::{Error, NotReadyReason, Result};
pub use notify::{Bus, Category, Notification, OperationGuard};
pub use results::BuildResult;
pub use schedulers::dependent::{DependentScheduler, DependentSpec};
pub use schedulers::{RegisteredScheduler, SchedulerRegistration, SubscribedBuildset};
pub use sourcestamps::{NewPatch, NewSourceStamp, Patch, SourceStamp};
