//! The association contract consumed by the DIMSE service layer.
//!
//! The transport below this crate owns PDU encoding and association
//! negotiation. Services and tasks only see the [`Association`] trait:
//! response writing, C-STORE sub-operation submission, cancel-request
//! registration, and a few state queries. Sub-operation completion is
//! delivered through a channel instead of a callback, so a task can
//! wait for its outstanding responses by draining the receiving end
//! and stop as soon as all senders are gone.

pub mod store;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::warn;

use crate::error::{ServiceError, WriteError};
use crate::status;

/// A shared flag raised when a C-CANCEL-RQ arrives for a
/// registered message ID.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Raise the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether a cancel request was received.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Unregisters a cancel handler when dropped,
/// so that a task leaving through any path cleans up after itself.
pub struct CancelGuard {
    association: Arc<dyn Association>,
    message_id: u16,
}

impl CancelGuard {
    /// Register a new cancel token for the given message ID
    /// and tie its removal to the guard's lifetime.
    pub fn register(association: Arc<dyn Association>, message_id: u16) -> (Self, CancelToken) {
        let token = CancelToken::new();
        association.register_cancel(message_id, token.clone());
        (
            CancelGuard {
                association,
                message_id,
            },
            token,
        )
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.association.unregister_cancel(self.message_id);
    }
}

/// Identification of the C-MOVE request on whose behalf a
/// C-STORE sub-operation is issued.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MoveOriginator {
    /// AE title of the node that issued the C-MOVE.
    pub ae_title: String,
    /// Message ID of the C-MOVE request.
    pub message_id: u16,
}

/// A single C-STORE sub-operation to be carried out over an association.
#[derive(Debug)]
pub struct SubOperation {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax in which `data` is encoded.
    pub transfer_syntax_uid: String,
    pub message_id: u16,
    pub priority: u16,
    pub originator: Option<MoveOriginator>,
    /// The data set bytes, without file meta group.
    pub data: Vec<u8>,
}

/// The outcome of a C-STORE sub-operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubOpRsp {
    pub sop_instance_uid: String,
    pub status: u16,
}

/// The common extended negotiation accepted for a SOP class,
/// as recorded during association negotiation.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CommonExtendedNegotiation {
    pub sop_class_uid: String,
    pub service_class_uid: String,
    pub related_general_sop_classes: Vec<String>,
}

/// An established DICOM association as seen by the service layer.
pub trait Association: Send + Sync {
    /// Write a DIMSE response message through the association.
    fn write_rsp(
        &self,
        presentation_context_id: u8,
        cmd: InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<(), WriteError>;

    /// Write a DIMSE response message, logging delivery failures
    /// instead of propagating them.
    ///
    /// Used for interim responses whose loss does not invalidate the
    /// operation, such as pending heartbeats.
    fn try_write_rsp(
        &self,
        presentation_context_id: u8,
        cmd: InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) {
        if let Err(e) = self.write_rsp(presentation_context_id, cmd, data) {
            warn!("failed to write interim response: {}", e);
        }
    }

    /// Allocate the next outgoing message ID.
    fn next_message_id(&self) -> u16;

    /// Whether messages can still be exchanged over this association.
    fn is_ready_for_data_transfer(&self) -> bool;

    /// The AE title of the peer.
    fn remote_ae_title(&self) -> String;

    /// The common extended negotiation accepted for the given SOP class,
    /// if any.
    fn common_extended_negotiation_for(
        &self,
        _sop_class_uid: &str,
    ) -> Option<CommonExtendedNegotiation> {
        None
    }

    /// Register a cancel token to be raised when a C-CANCEL-RQ for
    /// `message_id` arrives.
    fn register_cancel(&self, message_id: u16, token: CancelToken);

    /// Remove the cancel token registered for `message_id`.
    fn unregister_cancel(&self, message_id: u16);

    /// Submit a C-STORE sub-operation.
    ///
    /// The outcome is delivered through `rsp_tx` once the peer responds.
    /// Implementations drop the sender on association teardown, so a
    /// receiver draining completions observes a disconnect instead of
    /// waiting for responses that can no longer arrive.
    ///
    /// A submission that returns an error must not also deliver a
    /// response message for the sub-operation: the caller accounts for
    /// it through the error.
    fn cstore(&self, sub_op: SubOperation, rsp_tx: mpsc::Sender<SubOpRsp>)
        -> Result<(), WriteError>;

    /// Request an orderly release of the association.
    fn release(&self);
}

/// Where the encoded data set of an instance can be obtained.
#[derive(Debug, Clone)]
pub enum InstanceSource {
    /// A DICOM file with a meta group, as stored on disk.
    File(PathBuf),
    /// Data set bytes already encoded in the locator's transfer syntax.
    Memory(Vec<u8>),
}

/// A reference to a stored SOP instance to be sent in a C-STORE
/// operation.
#[derive(Debug, Clone)]
pub struct InstanceLocator {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax_uid: String,
    pub source: InstanceSource,
}

impl InstanceLocator {
    /// Produce the data set bytes of the instance, encoded in the
    /// locator's transfer syntax.
    pub fn read_data(&self) -> Result<Vec<u8>, ServiceError> {
        let ts = TransferSyntaxRegistry
            .get(&self.transfer_syntax_uid)
            .ok_or_else(|| {
                ServiceError::with_comment(
                    status::PROCESSING_FAILURE,
                    format!(
                        "Unsupported transfer syntax {} of instance {}",
                        self.transfer_syntax_uid, self.sop_instance_uid
                    ),
                )
            })?;
        match &self.source {
            InstanceSource::Memory(data) => Ok(data.clone()),
            InstanceSource::File(path) => {
                let object = dicom_object::open_file(path).map_err(|e| {
                    ServiceError::with_comment(
                        status::PROCESSING_FAILURE,
                        format!("Failed to open instance {}: {}", self.sop_instance_uid, e),
                    )
                })?;
                let mut data = Vec::new();
                object.write_dataset_with_ts(&mut data, ts).map_err(|e| {
                    ServiceError::with_comment(
                        status::PROCESSING_FAILURE,
                        format!("Failed to encode instance {}: {}", self.sop_instance_uid, e),
                    )
                })?;
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::FileMetaTableBuilder;

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn memory_locator_yields_data() {
        let locator = InstanceLocator {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            sop_instance_uid: "1.2.3.4".to_string(),
            transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
            source: InstanceSource::Memory(vec![1, 2, 3]),
        };
        assert_eq!(locator.read_data().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn file_locator_reencodes_the_stored_object() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, "Doe^John"),
        ));
        let file_object = obj
            .with_meta(
                FileMetaTableBuilder::default()
                    // Explicit VR Little Endian
                    .transfer_syntax("1.2.840.10008.1.2.1")
                    // Secondary Capture image storage
                    .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
                    .media_storage_sop_instance_uid("1.2.3.4"),
            )
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.2.3.4.dcm");
        file_object.write_to_file(&path).unwrap();

        let locator = InstanceLocator {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            sop_instance_uid: "1.2.3.4".to_string(),
            transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
            source: InstanceSource::File(path),
        };
        let data = locator.read_data().unwrap();

        // the data set comes back without the file meta group
        let ts = TransferSyntaxRegistry.get("1.2.840.10008.1.2.1").unwrap();
        let decoded = InMemDicomObject::read_dataset_with_ts(&data[..], ts).unwrap();
        assert_eq!(
            decoded
                .element(tags::PATIENT_NAME)
                .unwrap()
                .to_str()
                .unwrap(),
            "Doe^John",
        );
        assert!(decoded.element(tags::MEDIA_STORAGE_SOP_INSTANCE_UID).is_err());
    }

    #[test]
    fn unknown_transfer_syntax_is_a_processing_failure() {
        let locator = InstanceLocator {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            sop_instance_uid: "1.2.3.4".to_string(),
            transfer_syntax_uid: "1.2.999".to_string(),
            source: InstanceSource::Memory(vec![]),
        };
        let e = locator.read_data().unwrap_err();
        assert_eq!(e.status(), status::PROCESSING_FAILURE);
    }
}
