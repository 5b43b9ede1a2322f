//! This crate contains the DIMSE service layer for DICOM network nodes:
//! dispatching inbound command primitives to registered services and
//! executing query and retrieve exchanges with correct status-code
//! semantics, pending/cancel sequencing, and sub-operation accounting.
//!
//! The transport below is an external collaborator:
//! anything able to deliver command sets and data sets can back the
//! [`Association`] trait, with the DICOM upper layer protocol
//! (see the `dicom-ul` crate) as the canonical implementation.
//!
//! - The [`service`] module provides the [`ServiceRegistry`],
//!   which routes each inbound request to the handler registered for
//!   its SOP class and request kind,
//!   plus ready-made verification and query/retrieve providers.
//! - The [`task`] module provides the [`QueryTask`] and
//!   [`RetrieveTask`] engines driving multi-response exchanges.
//! - The [`scu`] module provides a batch C-STORE client with
//!   mergeable aggregate results.
//! - The [`command`] module builds and interprets DIMSE command sets.
//!
//! # Example
//!
//! Registering the verification service and dispatching a request:
//!
//! ```no_run
//! # use std::sync::Arc;
//! use dicom_dimse::service::{basic::EchoService, Payload, ServiceRegistry};
//!
//! # fn run(association: Arc<dyn dicom_dimse::Association>,
//! #        cmd: dicom_object::InMemDicomObject) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ServiceRegistry::new();
//! registry.register(EchoService::descriptor());
//!
//! // for each message received from the transport:
//! registry.dispatch(&association, 1, &cmd, Payload::None)?;
//! # Ok(())
//! # }
//! ```

pub mod association;
pub mod command;
pub mod error;
pub mod qrlevel;
pub mod scu;
pub mod service;
pub mod status;
pub mod task;

// re-exports

pub use association::store::{StoreAssociation, StoreAssociationOptions};
pub use association::{
    Association, CancelGuard, CancelToken, CommonExtendedNegotiation, InstanceLocator,
    InstanceSource, MoveOriginator, SubOpRsp, SubOperation,
};
pub use command::{DimseKind, RspCommand, SubOpCounts};
pub use error::{ServiceError, WriteError};
pub use qrlevel::QueryRetrieveLevel;
pub use scu::{CStoreResult, CStoreScu};
pub use service::{DimseContext, DimseHandler, Payload, ServiceDescriptor, ServiceRegistry};
pub use task::retrieve::StoreBinding;
pub use task::{MatchSource, QueryTask, RetrieveTask};
