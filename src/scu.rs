//! Batch C-STORE client over an established association.

use std::sync::mpsc;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::association::{Association, InstanceLocator, SubOperation};
use crate::command::PRIORITY_MEDIUM;
use crate::status;

/// The aggregate outcome of a batch of C-STORE operations.
///
/// Results from separate batches, possibly stored over different
/// associations, can be merged with [`extend`](Self::extend) into one
/// overall outcome with the usual precedence: an
/// unable-to-perform status is never downgraded, and any failure
/// dominates success.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CStoreResult {
    pub status: u16,
    pub completed: u16,
    pub warning: u16,
    /// SOP instance UIDs which could not be stored.
    pub failed: Vec<String>,
}

impl CStoreResult {
    fn rank(status: u16) -> u8 {
        match status {
            status::SUCCESS => 0,
            status::ONE_OR_MORE_FAILURES => 1,
            status::UNABLE_TO_PERFORM_SUB_OPERATIONS => 2,
            _ => 1,
        }
    }

    fn widen(&mut self, status: u16) {
        if Self::rank(status) > Self::rank(self.status) {
            self.status = status;
        }
    }

    /// Merge another batch outcome into this one.
    pub fn extend(&mut self, other: CStoreResult) {
        self.completed += other.completed;
        self.warning += other.warning;
        self.failed.extend(other.failed);
        self.widen(other.status);
    }
}

/// Stores batches of instances through one association.
pub struct CStoreScu {
    association: Arc<dyn Association>,
    priority: u16,
}

impl CStoreScu {
    pub fn new(association: Arc<dyn Association>) -> Self {
        CStoreScu {
            association,
            priority: PRIORITY_MEDIUM,
        }
    }

    /// Set the priority of the issued C-STORE operations.
    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    /// Store all the given instances, collecting the aggregate outcome.
    ///
    /// An instance that cannot be read or encoded is counted as failed
    /// and the batch continues; a delivery failure makes the current
    /// and all remaining instances failed, as the association can no
    /// longer be used.
    pub fn store(&self, instances: &[InstanceLocator]) -> CStoreResult {
        let mut result = CStoreResult::default();
        let (tx, rx) = mpsc::channel();
        let mut outstanding = 0usize;

        for (index, instance) in instances.iter().enumerate() {
            let data = match instance.read_data() {
                Ok(data) => data,
                Err(e) => {
                    warn!("skipping instance {}: {}", instance.sop_instance_uid, e);
                    result.failed.push(instance.sop_instance_uid.clone());
                    result.widen(status::ONE_OR_MORE_FAILURES);
                    continue;
                }
            };
            let sub_op = SubOperation {
                sop_class_uid: instance.sop_class_uid.clone(),
                sop_instance_uid: instance.sop_instance_uid.clone(),
                transfer_syntax_uid: instance.transfer_syntax_uid.clone(),
                message_id: self.association.next_message_id(),
                priority: self.priority,
                originator: None,
                data,
            };
            match self.association.cstore(sub_op, tx.clone()) {
                Ok(()) => outstanding += 1,
                Err(e) => {
                    warn!("store delivery failed: {}", e);
                    for instance in &instances[index..] {
                        result.failed.push(instance.sop_instance_uid.clone());
                    }
                    result.widen(status::UNABLE_TO_PERFORM_SUB_OPERATIONS);
                    break;
                }
            }
        }

        drop(tx);
        while outstanding > 0 {
            match rx.recv() {
                Ok(rsp) => {
                    if rsp.status == status::SUCCESS {
                        result.completed += 1;
                    } else if status::is_warning(rsp.status) {
                        result.warning += 1;
                    } else {
                        debug!(
                            "instance {} refused with status {:04X}H",
                            rsp.sop_instance_uid, rsp.status
                        );
                        result.failed.push(rsp.sop_instance_uid);
                        result.widen(status::ONE_OR_MORE_FAILURES);
                    }
                    outstanding -= 1;
                }
                Err(_) => {
                    warn!("lost {} outstanding store responses", outstanding);
                    result.widen(status::UNABLE_TO_PERFORM_SUB_OPERATIONS);
                    break;
                }
            }
        }

        if !result.failed.is_empty() && result.completed == 0 && result.warning == 0 {
            result.widen(status::UNABLE_TO_PERFORM_SUB_OPERATIONS);
        }
        result
    }
}
