//! Error types for DIMSE service processing.
//!
//! [`ServiceError`] is the protocol-level failure: it carries a DIMSE
//! status code plus the optional response fields (error comment,
//! offending elements, data set) that describe the failure to the peer.
//! Transport-level faults while writing to or reading from an
//! association are reported through [`WriteError`].

use std::fmt;

use dicom_core::Tag;
use dicom_object::InMemDicomObject;
use smallvec::SmallVec;
use snafu::{Backtrace, Snafu};

use crate::status;

/// A failure to deliver a message through an association.
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum WriteError {
    /// the association is no longer ready for data transfer
    #[snafu(display("association is no longer ready for data transfer"))]
    NotReady { backtrace: Backtrace },
    /// failed to encode the command set or data set
    #[snafu(display("failed to encode message"))]
    Encode { source: Box<dicom_object::WriteError> },
    /// failed to send the message through the transport
    #[snafu(display("failed to send message"))]
    Send {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    /// failed to receive a message from the transport
    #[snafu(display("failed to receive message"))]
    Receive {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    /// no presentation context accepted for the given
    /// abstract syntax and transfer syntax
    #[snafu(display(
        "no presentation context accepted for SOP class {} with transfer syntax {}",
        sop_class_uid,
        transfer_syntax_uid
    ))]
    NoAcceptedPresentationContext {
        sop_class_uid: String,
        transfer_syntax_uid: String,
        backtrace: Backtrace,
    },
    /// the upper layer reported an association fault
    #[snafu(whatever, display("{}", message))]
    Association {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// A DIMSE service failure with the status and descriptive fields
/// to be reported in the response command set.
///
/// Unlike [`WriteError`], a `ServiceError` is part of the protocol
/// conversation: the dispatcher converts it into a response message
/// rather than tearing the association down.
#[derive(Debug, Clone)]
pub struct ServiceError {
    status: u16,
    comment: Option<String>,
    offending_elements: SmallVec<[Tag; 2]>,
    data: Option<InMemDicomObject>,
}

impl ServiceError {
    /// Create a service error with the given status code.
    pub fn new(status: u16) -> Self {
        ServiceError {
            status,
            comment: None,
            offending_elements: SmallVec::new(),
            data: None,
        }
    }

    /// Create a service error with a status code and an error comment.
    pub fn with_comment(status: u16, comment: impl Into<String>) -> Self {
        ServiceError::new(status).comment(comment)
    }

    /// Attach an error comment (truncated to 64 characters on the wire).
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Attach the offending element tags.
    pub fn offending_elements(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.offending_elements.extend(tags);
        self
    }

    /// Attach a data set to accompany the response.
    pub fn data(mut self, data: InMemDicomObject) -> Self {
        self.data = Some(data);
        self
    }

    /// The DIMSE status code of this failure.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The error comment to report, if any.
    pub fn error_comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// The offending element tags to report.
    pub fn offending(&self) -> &[Tag] {
        &self.offending_elements
    }

    /// The data set to accompany the response, if any.
    pub fn data_set(&self) -> Option<&InMemDicomObject> {
        self.data.as_ref()
    }

    /// Take the data set out of the error.
    pub fn take_data_set(&mut self) -> Option<InMemDicomObject> {
        self.data.take()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DIMSE status {:04X}H", self.status)?;
        if let Some(comment) = &self.comment {
            write!(f, ": {}", comment)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

impl From<WriteError> for ServiceError {
    fn from(e: WriteError) -> Self {
        ServiceError::with_comment(status::PROCESSING_FAILURE, e.to_string())
    }
}
