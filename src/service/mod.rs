//! DIMSE service registration and dispatch.
//!
//! Services declare which request kinds and SOP classes they answer
//! through a [`ServiceDescriptor`]; the [`ServiceRegistry`] routes
//! every inbound request to the matching handler, with the
//! common-extended-negotiation fallback for storage of SOP classes
//! not registered directly.

pub mod basic;
pub mod qr;

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, RwLock};

use dicom_object::InMemDicomObject;
use snafu::whatever;
use tracing::{debug, warn};

use crate::association::Association;
use crate::command::{self, DimseKind, RspCommand};
use crate::error::{ServiceError, WriteError};
use crate::status;

/// The SOP class key matching any UID, usable by promiscuous storage
/// handlers. Only consulted when resolving C-STORE requests.
pub const ANY_SOP_CLASS: &str = "*";

/// The data set accompanying a request.
///
/// C-STORE payloads may arrive as a raw byte stream so that a storage
/// handler can spool large objects without decoding them; all other
/// operations carry their data set decoded.
pub enum Payload {
    None,
    Dataset(InMemDicomObject),
    Stream(Box<dyn Read + Send>),
}

/// Request routing information handed to a service handler.
#[derive(Debug, Clone)]
pub struct DimseContext {
    pub presentation_context_id: u8,
    pub kind: DimseKind,
    pub sop_class_uid: String,
    pub message_id: u16,
}

/// A service able to process inbound DIMSE requests.
pub trait DimseHandler: Send + Sync {
    /// Process one request.
    ///
    /// The handler is responsible for writing all responses of the
    /// exchange, possibly from another thread. Returning an error
    /// makes the dispatcher report it to the peer in a response
    /// carrying the error's status and descriptive fields.
    fn on_dimse_rq(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
        payload: Payload,
    ) -> Result<(), ServiceError>;

    /// Called when the association closes, normally or not.
    fn on_association_close(&self, _association: &Arc<dyn Association>) {}
}

/// Declaration of a service's capabilities:
/// the handler, the request kinds it answers,
/// and the SOP classes (or service class) it answers them for.
#[derive(Clone)]
pub struct ServiceDescriptor {
    sop_classes: Vec<String>,
    service_class_uid: Option<String>,
    kinds: Vec<DimseKind>,
    handler: Arc<dyn DimseHandler>,
}

impl ServiceDescriptor {
    pub fn new(handler: Arc<dyn DimseHandler>) -> Self {
        ServiceDescriptor {
            sop_classes: Vec::new(),
            service_class_uid: None,
            kinds: Vec::new(),
            handler,
        }
    }

    /// Declare the SOP classes answered by the handler.
    pub fn sop_classes<I, S>(mut self, uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sop_classes.extend(uids.into_iter().map(Into::into));
        self
    }

    /// Declare a service class answered by the handler, making it
    /// eligible for storage requests whose common extended negotiation
    /// names that service class.
    pub fn service_class(mut self, uid: impl Into<String>) -> Self {
        self.service_class_uid = Some(uid.into());
        self
    }

    /// Declare the request kinds answered by the handler.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = DimseKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }
}

#[derive(Default)]
struct Inner {
    by_kind: HashMap<DimseKind, HashMap<String, Arc<dyn DimseHandler>>>,
    service_classes: HashMap<String, Arc<dyn DimseHandler>>,
    sop_class_refs: HashMap<String, usize>,
    handlers: Vec<Arc<dyn DimseHandler>>,
}

/// Routes inbound DIMSE requests to registered services.
///
/// Registration may happen while associations are being served;
/// lookups take a shared lock.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<Inner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Register a service. A SOP class already claimed for the same
    /// request kind is taken over by the new handler.
    pub fn register(&self, descriptor: ServiceDescriptor) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for kind in &descriptor.kinds {
            let map = inner.by_kind.entry(*kind).or_default();
            for uid in &descriptor.sop_classes {
                if map
                    .insert(uid.clone(), Arc::clone(&descriptor.handler))
                    .is_some()
                {
                    warn!("replacing {:?} handler of SOP class {}", kind, uid);
                }
            }
        }
        for uid in &descriptor.sop_classes {
            *inner.sop_class_refs.entry(uid.clone()).or_insert(0) += descriptor.kinds.len();
        }
        if let Some(service_class) = &descriptor.service_class_uid {
            inner
                .service_classes
                .insert(service_class.clone(), Arc::clone(&descriptor.handler));
        }
        if !inner
            .handlers
            .iter()
            .any(|h| Arc::ptr_eq(h, &descriptor.handler))
        {
            inner.handlers.push(descriptor.handler);
        }
    }

    /// Remove every registration pointing at the given handler.
    pub fn unregister(&self, handler: &Arc<dyn DimseHandler>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for map in inner.by_kind.values_mut() {
            map.retain(|uid, h| {
                let keep = !Arc::ptr_eq(h, handler);
                if !keep {
                    debug!("unregistering handler of SOP class {}", uid);
                }
                keep
            });
        }
        inner.service_classes.retain(|_, h| !Arc::ptr_eq(h, handler));
        inner.handlers.retain(|h| !Arc::ptr_eq(h, handler));
        // rebuild the reference counts from what is left
        let mut refs = HashMap::new();
        for map in inner.by_kind.values() {
            for uid in map.keys() {
                *refs.entry(uid.clone()).or_insert(0) += 1;
            }
        }
        inner.sop_class_refs = refs;
    }

    /// Dispatch one inbound request to the matching service.
    ///
    /// Unknown SOP classes and undeclared request kinds are answered
    /// with the corresponding failure status; service errors raised by
    /// the handler are reported to the peer. An error is returned only
    /// when no response could be delivered at all.
    pub fn dispatch(
        &self,
        association: &Arc<dyn Association>,
        presentation_context_id: u8,
        cmd: &InMemDicomObject,
        payload: Payload,
    ) -> Result<(), WriteError> {
        let field = match command::command_field(cmd) {
            Ok(field) => field,
            Err(e) => whatever!("Could not dispatch request: {}", e),
        };
        if field == command::C_CANCEL_RQ {
            // cancel requests are consumed by the association layer
            debug!("ignoring stray C-CANCEL-RQ");
            return Ok(());
        }
        let kind = match DimseKind::from_command_field(field) {
            Some(kind) => kind,
            None => whatever!("Unrecognized command field {:04X}H", field),
        };
        let message_id = match command::message_id(cmd) {
            Ok(message_id) => message_id,
            Err(e) => whatever!("Could not dispatch {:?} request: {}", kind, e),
        };
        let sop_class_uid = match command::sop_class_uid(kind, cmd) {
            Ok(uid) => uid,
            Err(e) => {
                let rsp = RspCommand::new(kind, "", message_id).build_error(&e);
                return association.write_rsp(presentation_context_id, rsp, None);
            }
        };

        let handler = self.lookup(association, kind, &sop_class_uid);
        let ctx = DimseContext {
            presentation_context_id,
            kind,
            sop_class_uid,
            message_id,
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                let e = self.unsupported(kind, &ctx.sop_class_uid);
                debug!("refusing {:?} request: {}", kind, e);
                let rsp = RspCommand::new(kind, ctx.sop_class_uid, message_id).build_error(&e);
                return association.write_rsp(presentation_context_id, rsp, None);
            }
        };

        if let Err(mut e) = handler.on_dimse_rq(association, &ctx, cmd, payload) {
            warn!("{:?} request {} failed: {}", kind, message_id, e);
            let data = e.take_data_set();
            let rsp =
                RspCommand::new(kind, ctx.sop_class_uid, message_id).build_error(&e);
            association.try_write_rsp(presentation_context_id, rsp, data);
        }
        Ok(())
    }

    /// Notify every registered service that an association closed.
    pub fn on_association_close(&self, association: &Arc<dyn Association>) {
        let handlers = {
            let inner = self
                .inner
                .read()
                .unwrap_or_else(|e| e.into_inner());
            inner.handlers.clone()
        };
        for handler in handlers {
            handler.on_association_close(association);
        }
    }

    fn lookup(
        &self,
        association: &Arc<dyn Association>,
        kind: DimseKind,
        sop_class_uid: &str,
    ) -> Option<Arc<dyn DimseHandler>> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let map = inner.by_kind.get(&kind);
        if let Some(handler) = map.and_then(|m| m.get(sop_class_uid)) {
            return Some(Arc::clone(handler));
        }
        if kind == DimseKind::CStore {
            if let Some(negotiation) = association.common_extended_negotiation_for(sop_class_uid)
            {
                for related in &negotiation.related_general_sop_classes {
                    if let Some(handler) = map.and_then(|m| m.get(related)) {
                        debug!(
                            "storing {} as related general SOP class {}",
                            sop_class_uid, related
                        );
                        return Some(Arc::clone(handler));
                    }
                }
                if let Some(handler) =
                    inner.service_classes.get(&negotiation.service_class_uid)
                {
                    debug!(
                        "storing {} under service class {}",
                        sop_class_uid, negotiation.service_class_uid
                    );
                    return Some(Arc::clone(handler));
                }
            }
            // the promiscuous fallback applies to storage only
            return map.and_then(|m| m.get(ANY_SOP_CLASS)).map(Arc::clone);
        }
        None
    }

    fn unsupported(&self, kind: DimseKind, sop_class_uid: &str) -> ServiceError {
        let known = {
            let inner = self
                .inner
                .read()
                .unwrap_or_else(|e| e.into_inner());
            inner.sop_class_refs.contains_key(sop_class_uid)
        };
        if known {
            // the SOP class is served, just not for this operation
            ServiceError::with_comment(
                status::UNRECOGNIZED_OPERATION,
                format!("Unrecognized {:?} operation for {}", kind, sop_class_uid),
            )
        } else {
            ServiceError::with_comment(
                status::SOP_CLASS_NOT_SUPPORTED,
                format!("No such SOP class: {}", sop_class_uid),
            )
        }
    }
}
