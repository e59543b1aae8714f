#![warn(missing_docs)]

//! Replication topology controller for a 389 directory server: replica roles, agreements, winsync, CleanAllRUV

pub mod agreement;
pub mod cleanallruv;
pub mod cli;
pub mod config;
mod context;
pub mod controller;
pub mod dsconf;
pub mod entry;
pub mod error;
pub mod events;
pub mod fractional;
pub mod gateway;
pub mod lifecycle;
pub mod manager;
pub mod poller;
pub mod replica;
pub mod schedule;
pub mod secret;
pub mod winsync;

pub use agreement::{Agreement, AgreementFields, BindMethod, InitStatus, Transport};
pub use cleanallruv::{CleanAllRuvManager, CleanAllRuvTask, TaskState};
pub use config::ControllerConfig;
pub use controller::ReplicationController;
pub use dsconf::DsconfGateway;
pub use entry::{Entry, Payload};
pub use error::{Result, TopologyError, ValidationError};
pub use events::{EntityKind, EventBus, Snapshot, TopologyEvent, TopologyObserver, TracingObserver};
pub use fractional::AttrList;
pub use gateway::{ArgValue, Command, CommandGateway, Operation};
pub use lifecycle::{AgreementEdit, AgreementKind, AgreementManager, AgreementRecord, AgreementSpec};
pub use manager::{ManagerRegistry, ManagerState, NewManager};
pub use poller::{PollKey, PollOutcome, PollTicket, PollerRegistry};
pub use replica::{
    ChangelogAttr, ChangelogSettings, EnableRequest, ReplicaAttr, ReplicaConfig, ReplicaId,
    ReplicaRole, ReplicaSettings, RoleRequest,
};
pub use schedule::{Schedule, TimeOfDay, Weekday};
pub use secret::Secret;
pub use winsync::{WinsyncAddress, WinsyncAgreement, WinsyncFields};
