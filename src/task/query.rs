//! C-FIND query task execution.

use std::sync::Arc;

use dicom_core::header::Header;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::debug;

use crate::association::{Association, CancelGuard};
use crate::command::{DimseKind, RspCommand};
use crate::error::{ServiceError, WriteError};
use crate::status;

/// A backend producing the matches of one C-FIND request.
///
/// The task drives the source one match at a time, so backends can
/// stream results from a database cursor without materializing the
/// full result set.
pub trait MatchSource: Send {
    /// Whether at least one more match is available.
    fn has_more(&mut self) -> Result<bool, ServiceError>;

    /// Produce the next match.
    ///
    /// Only called after [`has_more`](Self::has_more) returned `true`.
    fn next(&mut self) -> Result<InMemDicomObject, ServiceError>;

    /// Whether all optional keys of the request are supported for
    /// matching. When `false`, pending responses carry the
    /// pending-warning status.
    fn optional_keys_supported(&self) -> bool {
        true
    }

    /// Release any resources held by the source.
    fn close(&mut self) {}
}

/// Project a match onto the keys requested by the identifier.
///
/// Only elements whose tags appear in `keys` are kept, with
/// _Specific Character Set_ always carried over so that the
/// projection remains decodable.
pub fn adjust(matched: &InMemDicomObject, keys: &InMemDicomObject) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(
        matched
            .into_iter()
            .filter(|e| {
                e.tag() == tags::SPECIFIC_CHARACTER_SET || keys.element(e.tag()).is_ok()
            })
            .cloned(),
    )
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(ServiceError),
}

/// Executes one C-FIND request:
/// streams a pending response per match and closes the exchange with
/// success, cancel, or failure.
pub struct QueryTask {
    association: Arc<dyn Association>,
    presentation_context_id: u8,
    sop_class_uid: String,
    message_id: u16,
    keys: InMemDicomObject,
    source: Box<dyn MatchSource>,
}

impl QueryTask {
    pub fn new(
        association: Arc<dyn Association>,
        presentation_context_id: u8,
        sop_class_uid: impl Into<String>,
        message_id: u16,
        keys: InMemDicomObject,
        source: Box<dyn MatchSource>,
    ) -> Self {
        QueryTask {
            association,
            presentation_context_id,
            sop_class_uid: sop_class_uid.into(),
            message_id,
            keys,
            source,
        }
    }

    /// Run the query to completion.
    ///
    /// Returns an error only when a response could not be delivered;
    /// service failures from the match source are reported to the peer
    /// in the terminal response.
    pub fn run(mut self) -> Result<(), WriteError> {
        let (guard, token) =
            CancelGuard::register(Arc::clone(&self.association), self.message_id);
        let pending_status = if self.source.optional_keys_supported() {
            status::PENDING
        } else {
            status::PENDING_WARNING
        };

        let outcome = loop {
            match self.source.has_more() {
                Ok(true) => {}
                Ok(false) => break Outcome::Completed,
                Err(e) => break Outcome::Failed(e),
            }
            if token.is_cancelled() {
                break Outcome::Cancelled;
            }
            let matched = match self.source.next() {
                Ok(matched) => matched,
                Err(e) => break Outcome::Failed(e),
            };
            let adjusted = adjust(&matched, &self.keys);
            let cmd = self.rsp().status(pending_status).with_data_set(true).build();
            if let Err(e) =
                self.association
                    .write_rsp(self.presentation_context_id, cmd, Some(adjusted))
            {
                self.source.close();
                return Err(e);
            }
        };
        self.source.close();
        drop(guard);

        let (cmd, data) = match outcome {
            Outcome::Completed => (self.rsp().build(), None),
            Outcome::Cancelled => {
                debug!("query {} cancelled by peer", self.message_id);
                (self.rsp().status(status::CANCEL).build(), None)
            }
            Outcome::Failed(mut e) => {
                let data = e.take_data_set();
                (self.rsp().build_error(&e), data)
            }
        };
        self.association
            .write_rsp(self.presentation_context_id, cmd, data)
    }

    fn rsp(&self) -> RspCommand {
        RspCommand::new(DimseKind::CFind, self.sop_class_uid.clone(), self.message_id)
    }
}
