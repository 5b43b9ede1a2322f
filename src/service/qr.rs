//! Query/retrieve SCP adapters.
//!
//! These handlers validate the request identifier, ask the backing
//! service for matches, and run the exchange in a [`QueryTask`] or
//! [`RetrieveTask`] on a worker thread so the association's receive
//! loop stays free for further requests and cancels.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dicom_object::InMemDicomObject;
use tracing::warn;

use crate::association::{Association, InstanceLocator};
use crate::command::{self, DimseKind};
use crate::error::ServiceError;
use crate::qrlevel::QueryRetrieveLevel;
use crate::status;
use crate::task::{MatchSource, QueryTask, RetrieveTask};

use super::{DimseContext, DimseHandler, Payload};

/// A query backend: produces the matches of a C-FIND request.
pub trait QueryService: Send + Sync {
    /// Open a match source for the validated identifier.
    fn create_match_source(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        keys: &InMemDicomObject,
        level: QueryRetrieveLevel,
    ) -> Result<Box<dyn MatchSource>, ServiceError>;
}

/// A retrieve backend: locates the instances selected by a
/// C-GET/C-MOVE identifier and resolves move destinations.
pub trait RetrieveService: Send + Sync {
    /// Locate the instances selected by the validated identifier.
    fn calculate_matches(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        keys: &InMemDicomObject,
        level: QueryRetrieveLevel,
    ) -> Result<Vec<InstanceLocator>, ServiceError>;

    /// Establish the store association towards a move destination.
    ///
    /// An unknown AE title is reported with the
    /// move-destination-unknown status.
    fn store_association_for(
        &self,
        association: &Arc<dyn Association>,
        destination: &str,
        instances: &[InstanceLocator],
    ) -> Result<Arc<dyn Association>, ServiceError>;
}

/// C-FIND SCP over a [`QueryService`].
pub struct BasicQueryScp<Q> {
    service: Arc<Q>,
    levels: &'static [QueryRetrieveLevel],
    relational: bool,
}

impl<Q> BasicQueryScp<Q> {
    pub fn new(service: Arc<Q>, levels: &'static [QueryRetrieveLevel]) -> Self {
        BasicQueryScp {
            service,
            levels,
            relational: false,
        }
    }

    /// Accept relational queries, lifting the hierarchical
    /// unique key requirements.
    pub fn relational(mut self, relational: bool) -> Self {
        self.relational = relational;
        self
    }
}

impl<Q: QueryService + 'static> DimseHandler for BasicQueryScp<Q> {
    fn on_dimse_rq(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        _cmd: &InMemDicomObject,
        payload: Payload,
    ) -> Result<(), ServiceError> {
        let keys = require_identifier(payload)?;
        let level =
            QueryRetrieveLevel::validate_query_identifier(&keys, self.levels, self.relational)?;
        let source = self
            .service
            .create_match_source(association, ctx, &keys, level)?;
        let task = QueryTask::new(
            Arc::clone(association),
            ctx.presentation_context_id,
            ctx.sop_class_uid.clone(),
            ctx.message_id,
            keys,
            source,
        );
        let message_id = ctx.message_id;
        thread::spawn(move || {
            if let Err(e) = task.run() {
                warn!("query {} aborted: {}", message_id, e);
            }
        });
        Ok(())
    }
}

/// C-GET/C-MOVE SCP over a [`RetrieveService`].
pub struct BasicRetrieveScp<R> {
    service: Arc<R>,
    levels: &'static [QueryRetrieveLevel],
    relational: bool,
    pending_interval: Option<Duration>,
}

impl<R> BasicRetrieveScp<R> {
    pub fn new(service: Arc<R>, levels: &'static [QueryRetrieveLevel]) -> Self {
        BasicRetrieveScp {
            service,
            levels,
            relational: false,
            pending_interval: None,
        }
    }

    /// Accept relational retrieves.
    pub fn relational(mut self, relational: bool) -> Self {
        self.relational = relational;
        self
    }

    /// Report interim pending responses at the given interval.
    pub fn pending_interval(mut self, interval: Duration) -> Self {
        self.pending_interval = Some(interval);
        self
    }
}

impl<R: RetrieveService + 'static> DimseHandler for BasicRetrieveScp<R> {
    fn on_dimse_rq(
        &self,
        association: &Arc<dyn Association>,
        ctx: &DimseContext,
        cmd: &InMemDicomObject,
        payload: Payload,
    ) -> Result<(), ServiceError> {
        let keys = require_identifier(payload)?;
        let level =
            QueryRetrieveLevel::validate_retrieve_identifier(&keys, self.levels, self.relational)?;
        let instances = self
            .service
            .calculate_matches(association, ctx, &keys, level)?;
        let priority = command::priority(cmd);

        let mut task = match ctx.kind {
            DimseKind::CGet => RetrieveTask::c_get(
                Arc::clone(association),
                ctx.presentation_context_id,
                ctx.sop_class_uid.clone(),
                ctx.message_id,
                priority,
                instances,
            ),
            DimseKind::CMove => {
                let destination = command::move_destination(cmd)?;
                let store =
                    self.service
                        .store_association_for(association, &destination, &instances);
                RetrieveTask::c_move(
                    Arc::clone(association),
                    ctx.presentation_context_id,
                    ctx.sop_class_uid.clone(),
                    ctx.message_id,
                    priority,
                    store,
                    instances,
                )
            }
            kind => {
                return Err(ServiceError::with_comment(
                    status::UNRECOGNIZED_OPERATION,
                    format!("Unsupported {:?} operation for retrieve", kind),
                ))
            }
        };
        if let Some(interval) = self.pending_interval {
            task = task.pending_interval(interval);
        }
        let message_id = ctx.message_id;
        thread::spawn(move || {
            if let Err(e) = task.run() {
                warn!("retrieve {} aborted: {}", message_id, e);
            }
        });
        Ok(())
    }
}

fn require_identifier(payload: Payload) -> Result<InMemDicomObject, ServiceError> {
    match payload {
        Payload::Dataset(keys) => Ok(keys),
        _ => Err(ServiceError::with_comment(
            status::MISTYPED_ARGUMENT,
            "Missing identifier data set",
        )),
    }
}
