//! C-GET/C-MOVE retrieve task execution.
//!
//! A retrieve task turns a list of [`InstanceLocator`]s into C-STORE
//! sub-operations, keeps progress counters, optionally reports them
//! in interim pending responses, and closes the exchange with the
//! aggregate outcome. Sub-operation completions come back through a
//! channel; once the task's own sender is dropped, a disconnect on
//! that channel means no further responses can arrive and the wait
//! for outstanding sub-operations ends.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::{debug, warn};

use crate::association::{
    Association, CancelGuard, InstanceLocator, MoveOriginator, SubOpRsp, SubOperation,
};
use crate::command::{DimseKind, RspCommand, SubOpCounts};
use crate::error::{ServiceError, WriteError};
use crate::status;

/// Sub-operation progress of a retrieve task.
#[derive(Debug, Default)]
pub struct Progress {
    total: usize,
    completed: u16,
    warning: u16,
    failed: u16,
    failed_uids: Vec<String>,
    pinned: Option<u16>,
}

impl Progress {
    fn with_total(total: usize) -> Self {
        Progress {
            total,
            ..Progress::default()
        }
    }

    /// Record the outcome of one sub-operation.
    fn record(&mut self, rsp: &SubOpRsp) {
        if rsp.status == status::SUCCESS {
            self.completed += 1;
        } else if status::is_warning(rsp.status) {
            self.warning += 1;
        } else {
            self.failed += 1;
            self.failed_uids.push(rsp.sop_instance_uid.clone());
            self.pin(status::ONE_OR_MORE_FAILURES);
        }
    }

    /// Count an instance as failed without a sub-operation.
    fn fail(&mut self, sop_instance_uid: &str, pinned: u16) {
        self.failed += 1;
        self.failed_uids.push(sop_instance_uid.to_string());
        self.pin(pinned);
    }

    /// Pin a terminal failure status. The first pinned status wins;
    /// the only permitted change is the upgrade from
    /// one-or-more-failures to unable-to-perform-sub-operations.
    fn pin(&mut self, status: u16) {
        match self.pinned {
            None => self.pinned = Some(status),
            Some(status::ONE_OR_MORE_FAILURES)
                if status == status::UNABLE_TO_PERFORM_SUB_OPERATIONS =>
            {
                self.pinned = Some(status)
            }
            Some(_) => {}
        }
    }

    /// Number of sub-operations not yet resolved.
    pub fn remaining(&self) -> u16 {
        self.total
            .saturating_sub(self.completed as usize + self.warning as usize + self.failed as usize)
            as u16
    }

    fn counts(&self, with_remaining: bool) -> SubOpCounts {
        SubOpCounts {
            remaining: if with_remaining {
                Some(self.remaining())
            } else {
                None
            },
            completed: self.completed,
            failed: self.failed,
            warning: self.warning,
        }
    }

    fn final_status(&self) -> u16 {
        match self.pinned {
            // all sub-operations failed outright
            Some(status::ONE_OR_MORE_FAILURES)
                if self.completed == 0 && self.warning == 0 && self.failed > 0 =>
            {
                status::UNABLE_TO_PERFORM_SUB_OPERATIONS
            }
            Some(status) => status,
            None => status::SUCCESS,
        }
    }
}

/// Where a retrieve task sends its C-STORE sub-operations.
pub enum StoreBinding {
    /// Back through the requesting association — C-GET semantics.
    Requester,
    /// Through a separate association towards the move destination —
    /// C-MOVE semantics. An establishment failure is carried as an
    /// error so the task can account for every instance before
    /// responding.
    Destination(Result<Arc<dyn Association>, ServiceError>),
}

/// Executes one C-GET or C-MOVE request.
pub struct RetrieveTask {
    association: Arc<dyn Association>,
    presentation_context_id: u8,
    kind: DimseKind,
    sop_class_uid: String,
    message_id: u16,
    priority: u16,
    binding: StoreBinding,
    instances: Vec<InstanceLocator>,
    pending_interval: Option<Duration>,
}

impl RetrieveTask {
    /// Create a task answering a C-GET request, with sub-operations
    /// going back through the requesting association.
    pub fn c_get(
        association: Arc<dyn Association>,
        presentation_context_id: u8,
        sop_class_uid: impl Into<String>,
        message_id: u16,
        priority: u16,
        instances: Vec<InstanceLocator>,
    ) -> Self {
        RetrieveTask {
            association,
            presentation_context_id,
            kind: DimseKind::CGet,
            sop_class_uid: sop_class_uid.into(),
            message_id,
            priority,
            binding: StoreBinding::Requester,
            instances,
            pending_interval: None,
        }
    }

    /// Create a task answering a C-MOVE request, with sub-operations
    /// going through the given destination association.
    pub fn c_move(
        association: Arc<dyn Association>,
        presentation_context_id: u8,
        sop_class_uid: impl Into<String>,
        message_id: u16,
        priority: u16,
        destination: Result<Arc<dyn Association>, ServiceError>,
        instances: Vec<InstanceLocator>,
    ) -> Self {
        RetrieveTask {
            association,
            presentation_context_id,
            kind: DimseKind::CMove,
            sop_class_uid: sop_class_uid.into(),
            message_id,
            priority,
            binding: StoreBinding::Destination(destination),
            instances,
            pending_interval: None,
        }
    }

    /// Report interim pending responses with the current counters
    /// at the given interval while sub-operations are in progress.
    pub fn pending_interval(mut self, interval: Duration) -> Self {
        self.pending_interval = Some(interval);
        self
    }

    /// Run the retrieve to completion.
    ///
    /// Returns an error only when the terminal response could not be
    /// delivered to the requester.
    pub fn run(self) -> Result<(), WriteError> {
        let (guard, token) =
            CancelGuard::register(Arc::clone(&self.association), self.message_id);
        let progress = Arc::new(Mutex::new(Progress::with_total(self.instances.len())));

        let (store, originator, release_store, binding_error) = match &self.binding {
            StoreBinding::Requester => (Some(Arc::clone(&self.association)), None, false, None),
            StoreBinding::Destination(Ok(store)) => (
                Some(Arc::clone(store)),
                Some(MoveOriginator {
                    ae_title: self.association.remote_ae_title(),
                    message_id: self.message_id,
                }),
                true,
                None,
            ),
            StoreBinding::Destination(Err(e)) => (None, None, false, Some(e.clone())),
        };

        let heartbeat = self.pending_interval.map(|interval| {
            Heartbeat::start(
                Arc::clone(&self.association),
                self.presentation_context_id,
                self.kind,
                self.sop_class_uid.clone(),
                self.message_id,
                interval,
                Arc::clone(&progress),
            )
        });

        let mut cancelled = false;
        match store {
            None => {
                // no way to carry out any sub-operation
                let pinned = binding_error
                    .as_ref()
                    .map(|e| e.status())
                    .unwrap_or(status::UNABLE_TO_PERFORM_SUB_OPERATIONS);
                if let Some(e) = &binding_error {
                    warn!("store association unavailable: {}", e);
                }
                let mut progress = lock(&progress);
                for instance in &self.instances {
                    progress.fail(&instance.sop_instance_uid, pinned);
                }
            }
            Some(store) => {
                let (tx, rx) = mpsc::channel();
                let mut in_flight: Vec<String> = Vec::new();
                let total = self.instances.len();
                for (index, instance) in self.instances.iter().enumerate() {
                    if token.is_cancelled() {
                        debug!("retrieve {} cancelled by peer", self.message_id);
                        cancelled = true;
                        break;
                    }
                    let data = match instance.read_data() {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(
                                "skipping instance {}: {}",
                                instance.sop_instance_uid, e
                            );
                            lock(&progress).fail(
                                &instance.sop_instance_uid,
                                status::ONE_OR_MORE_FAILURES,
                            );
                            continue;
                        }
                    };
                    let sub_op = SubOperation {
                        sop_class_uid: instance.sop_class_uid.clone(),
                        sop_instance_uid: instance.sop_instance_uid.clone(),
                        transfer_syntax_uid: instance.transfer_syntax_uid.clone(),
                        message_id: store.next_message_id(),
                        priority: self.priority,
                        originator: originator.clone(),
                        data,
                    };
                    match store.cstore(sub_op, tx.clone()) {
                        Ok(()) => in_flight.push(instance.sop_instance_uid.clone()),
                        Err(e) => {
                            warn!("sub-operation delivery failed: {}", e);
                            let mut progress = lock(&progress);
                            progress.fail(
                                &instance.sop_instance_uid,
                                status::UNABLE_TO_PERFORM_SUB_OPERATIONS,
                            );
                            for instance in &self.instances[index + 1..total] {
                                progress.fail(
                                    &instance.sop_instance_uid,
                                    status::UNABLE_TO_PERFORM_SUB_OPERATIONS,
                                );
                            }
                            break;
                        }
                    }
                }
                // only implementations hold senders now; a disconnect
                // means the remaining responses can no longer arrive
                drop(tx);
                while !in_flight.is_empty() {
                    match rx.recv() {
                        Ok(rsp) => {
                            if let Some(pos) = in_flight
                                .iter()
                                .position(|uid| *uid == rsp.sop_instance_uid)
                            {
                                in_flight.swap_remove(pos);
                                lock(&progress).record(&rsp);
                            }
                        }
                        Err(_) => {
                            warn!(
                                "lost {} outstanding sub-operation responses",
                                in_flight.len()
                            );
                            let mut progress = lock(&progress);
                            for uid in in_flight.drain(..) {
                                progress.fail(
                                    &uid,
                                    status::UNABLE_TO_PERFORM_SUB_OPERATIONS,
                                );
                            }
                            break;
                        }
                    }
                }
                if release_store {
                    store.release();
                }
            }
        }

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
        drop(guard);

        let progress = lock(&progress);
        let final_status = if cancelled {
            status::CANCEL
        } else {
            progress.final_status()
        };
        let data = if progress.failed_uids.is_empty() {
            None
        } else {
            Some(InMemDicomObject::from_element_iter([DataElement::new(
                tags::FAILED_SOP_INSTANCE_UID_LIST,
                VR::UI,
                PrimitiveValue::Strs(progress.failed_uids.iter().cloned().collect()),
            )]))
        };
        let cmd = RspCommand::new(self.kind, self.sop_class_uid.clone(), self.message_id)
            .status(final_status)
            .counts(progress.counts(final_status == status::CANCEL))
            .with_data_set(data.is_some())
            .build();
        self.association
            .write_rsp(self.presentation_context_id, cmd, data)
    }
}

fn lock<'a>(progress: &'a Arc<Mutex<Progress>>) -> MutexGuard<'a, Progress> {
    progress.lock().unwrap_or_else(|e| e.into_inner())
}

/// Interim pending response ticker.
struct Heartbeat {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    #[allow(clippy::too_many_arguments)]
    fn start(
        association: Arc<dyn Association>,
        presentation_context_id: u8,
        kind: DimseKind,
        sop_class_uid: String,
        message_id: u16,
        interval: Duration,
        progress: Arc<Mutex<Progress>>,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let counts = lock(&progress).counts(true);
                    let cmd = RspCommand::new(kind, sop_class_uid.clone(), message_id)
                        .status(status::PENDING)
                        .counts(counts)
                        .build();
                    association.try_write_rsp(presentation_context_id, cmd, None);
                }
                _ => break,
            }
        });
        Heartbeat { stop_tx, handle }
    }

    fn stop(self) {
        drop(self.stop_tx);
        if self.handle.join().is_err() {
            warn!("pending response ticker panicked");
        }
    }
}
