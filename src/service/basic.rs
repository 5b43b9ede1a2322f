//! Elementary services: verification and normalized operation hooks.

use std::sync::Arc;

use dicom_dictionary_std::uids;
use dicom_object::InMemDicomObject;

use crate::association::Association;
use crate::command::{DimseKind, RspCommand};
use crate::error::ServiceError;
use crate::status;

use super::{DimseContext, DimseHandler, Payload, ServiceDescriptor};

/// The verification service: answers every C-ECHO with success.
#[derive(Debug, Default)]
pub struct EchoService;

impl EchoService {
    /// The descriptor registering verification under its SOP class.
    pub fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(Arc::new(EchoService))
            .sop_classes([uids::VERIFICATION])
            .kinds([DimseKind::CEcho])
    }
}

impl DimseHandler for EchoService {
    fn on_dimse_rq(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        _cmd: &InMemDicomObject,
        _payload: Payload,
    ) -> Result<(), ServiceError> {
        let rsp = RspCommand::new(ctx.kind, ctx.sop_class_uid.clone(), ctx.message_id).build();
        association
            .write_rsp(ctx.presentation_context_id, rsp, None)
            .map_err(Into::into)
    }
}

/// Hooks for the normalized DIMSE operations of one SOP class.
///
/// Every hook defaults to refusing the operation, so a service only
/// implements the operations it actually supports. A hook may return
/// a data set to be carried in the response.
#[allow(unused_variables)]
pub trait SopService: Send + Sync {
    fn create(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        Err(unrecognized(ctx.kind))
    }

    fn set(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        Err(unrecognized(ctx.kind))
    }

    fn get(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        Err(unrecognized(ctx.kind))
    }

    fn action(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        Err(unrecognized(ctx.kind))
    }

    fn delete(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        Err(unrecognized(ctx.kind))
    }

    fn event_report(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        Err(unrecognized(ctx.kind))
    }
}

fn unrecognized(kind: DimseKind) -> ServiceError {
    ServiceError::with_comment(
        status::UNRECOGNIZED_OPERATION,
        format!("Unsupported {:?} operation", kind),
    )
}

/// Adapts a [`SopService`] to the dispatch interface,
/// writing the response of each normalized operation.
pub struct SopServiceHandler<S> {
    service: S,
}

impl<S: SopService> SopServiceHandler<S> {
    pub fn new(service: S) -> Self {
        SopServiceHandler { service }
    }
}

impl<S: SopService> DimseHandler for SopServiceHandler<S> {
    fn on_dimse_rq(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
        payload: Payload,
    ) -> Result<(), ServiceError> {
        let data = match payload {
            Payload::None => None,
            Payload::Dataset(data) => Some(data),
            Payload::Stream(_) => {
                return Err(ServiceError::with_comment(
                    status::MISTYPED_ARGUMENT,
                    "Unexpected data stream in normalized operation",
                ))
            }
        };
        let rsp_data = match ctx.kind {
            DimseKind::NCreate => self.service.create(association, ctx, cmd, data)?,
            DimseKind::NSet => self.service.set(association, ctx, cmd, data)?,
            DimseKind::NGet => self.service.get(association, ctx, cmd)?,
            DimseKind::NAction => self.service.action(association, ctx, cmd, data)?,
            DimseKind::NDelete => self.service.delete(association, ctx, cmd)?,
            DimseKind::NEventReport => self.service.event_report(association, ctx, cmd, data)?,
            _ => return Err(unrecognized(ctx.kind)),
        };
        let rsp = RspCommand::new(ctx.kind, ctx.sop_class_uid.clone(), ctx.message_id)
            .with_data_set(rsp_data.is_some())
            .build();
        association
            .write_rsp(ctx.presentation_context_id, rsp, rsp_data)
            .map_err(Into::into)
    }
}
