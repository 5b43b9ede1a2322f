//! In-memory association double for service and task tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{mpsc, Mutex};

use dicom_dimse::error::WriteError;
use dicom_dimse::{
    Association, CancelToken, CommonExtendedNegotiation, SubOpRsp, SubOperation,
};
use dicom_object::InMemDicomObject;
use snafu::whatever;

/// What the fake should do with one submitted C-STORE sub-operation.
pub enum StoreScript {
    /// Deliver a response with the given status.
    Respond(u16),
    /// Deliver a response with the given status after a pause.
    RespondAfter(std::time::Duration, u16),
    /// Deliver a response with the given status from another thread.
    RespondInBackground(std::time::Duration, u16),
    /// Fail the submission, as if the transport broke.
    Refuse,
    /// Accept the sub-operation but never deliver a response.
    Swallow,
}

/// A recorded response message.
pub struct WrittenRsp {
    pub presentation_context_id: u8,
    pub cmd: InMemDicomObject,
    pub data: Option<InMemDicomObject>,
}

/// A record of one submitted sub-operation.
pub struct SubOpRecord {
    pub sop_instance_uid: String,
    pub originator_aet: Option<String>,
    pub originator_message_id: Option<u16>,
}

#[derive(Default)]
pub struct FakeAssociation {
    pub remote_aet: String,
    ready: AtomicBool,
    released: AtomicBool,
    message_id: AtomicU16,
    rsps: Mutex<Vec<WrittenRsp>>,
    cancels: Mutex<HashMap<u16, CancelToken>>,
    store_script: Mutex<VecDeque<StoreScript>>,
    sub_ops: Mutex<Vec<SubOpRecord>>,
    negotiations: Mutex<HashMap<String, CommonExtendedNegotiation>>,
}

impl FakeAssociation {
    pub fn new(remote_aet: &str) -> Self {
        let fake = FakeAssociation {
            remote_aet: remote_aet.to_string(),
            ..FakeAssociation::default()
        };
        fake.ready.store(true, Ordering::Relaxed);
        fake.message_id.store(1, Ordering::Relaxed);
        fake
    }

    /// Script the outcomes of the next sub-operations, in order.
    pub fn script_stores(&self, script: impl IntoIterator<Item = StoreScript>) {
        self.store_script
            .lock()
            .unwrap()
            .extend(script);
    }

    /// Record a common extended negotiation for a SOP class.
    pub fn add_negotiation(&self, negotiation: CommonExtendedNegotiation) {
        self.negotiations
            .lock()
            .unwrap()
            .insert(negotiation.sop_class_uid.clone(), negotiation);
    }

    /// Deliver a C-CANCEL-RQ for the given message ID.
    pub fn cancel(&self, message_id: u16) {
        if let Some(token) = self.cancels.lock().unwrap().get(&message_id) {
            token.cancel();
        }
    }

    pub fn written_rsps(&self) -> std::sync::MutexGuard<'_, Vec<WrittenRsp>> {
        self.rsps.lock().unwrap()
    }

    pub fn sub_ops(&self) -> std::sync::MutexGuard<'_, Vec<SubOpRecord>> {
        self.sub_ops.lock().unwrap()
    }

    pub fn has_cancel_handler(&self, message_id: u16) -> bool {
        self.cancels.lock().unwrap().contains_key(&message_id)
    }

    pub fn was_released(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

impl Association for FakeAssociation {
    fn write_rsp(
        &self,
        presentation_context_id: u8,
        cmd: InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<(), WriteError> {
        if !self.ready.load(Ordering::Relaxed) {
            whatever!("association is down");
        }
        self.rsps.lock().unwrap().push(WrittenRsp {
            presentation_context_id,
            cmd,
            data,
        });
        Ok(())
    }

    fn next_message_id(&self) -> u16 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_ready_for_data_transfer(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn remote_ae_title(&self) -> String {
        self.remote_aet.clone()
    }

    fn common_extended_negotiation_for(
        &self,
        sop_class_uid: &str,
    ) -> Option<CommonExtendedNegotiation> {
        self.negotiations.lock().unwrap().get(sop_class_uid).cloned()
    }

    fn register_cancel(&self, message_id: u16, token: CancelToken) {
        self.cancels.lock().unwrap().insert(message_id, token);
    }

    fn unregister_cancel(&self, message_id: u16) {
        self.cancels.lock().unwrap().remove(&message_id);
    }

    fn cstore(
        &self,
        sub_op: SubOperation,
        rsp_tx: mpsc::Sender<SubOpRsp>,
    ) -> Result<(), WriteError> {
        let action = self
            .store_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StoreScript::Respond(0));
        self.sub_ops.lock().unwrap().push(SubOpRecord {
            sop_instance_uid: sub_op.sop_instance_uid.clone(),
            originator_aet: sub_op.originator.as_ref().map(|o| o.ae_title.clone()),
            originator_message_id: sub_op.originator.as_ref().map(|o| o.message_id),
        });
        match action {
            StoreScript::Respond(status) => {
                let _ = rsp_tx.send(SubOpRsp {
                    sop_instance_uid: sub_op.sop_instance_uid,
                    status,
                });
                Ok(())
            }
            StoreScript::RespondAfter(pause, status) => {
                std::thread::sleep(pause);
                let _ = rsp_tx.send(SubOpRsp {
                    sop_instance_uid: sub_op.sop_instance_uid,
                    status,
                });
                Ok(())
            }
            StoreScript::RespondInBackground(pause, status) => {
                let sop_instance_uid = sub_op.sop_instance_uid;
                std::thread::spawn(move || {
                    std::thread::sleep(pause);
                    let _ = rsp_tx.send(SubOpRsp {
                        sop_instance_uid,
                        status,
                    });
                });
                Ok(())
            }
            StoreScript::Swallow => {
                // sender dropped here: the response never comes
                Ok(())
            }
            StoreScript::Refuse => whatever!("transport broke"),
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::Relaxed);
    }
}
