//! DIMSE command set construction and interpretation.
//!
//! A command set is an [`InMemDicomObject`] of group `0000` elements.
//! This module provides the command field code constants,
//! the [`DimseKind`] classification of request primitives,
//! accessors for the request fields that dispatch needs,
//! and builders for response command sets.

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use crate::error::ServiceError;
use crate::status;

/// C-STORE-RQ command field code.
pub const C_STORE_RQ: u16 = 0x0001;
/// C-GET-RQ command field code.
pub const C_GET_RQ: u16 = 0x0010;
/// C-FIND-RQ command field code.
pub const C_FIND_RQ: u16 = 0x0020;
/// C-MOVE-RQ command field code.
pub const C_MOVE_RQ: u16 = 0x0021;
/// C-ECHO-RQ command field code.
pub const C_ECHO_RQ: u16 = 0x0030;
/// N-EVENT-REPORT-RQ command field code.
pub const N_EVENT_REPORT_RQ: u16 = 0x0100;
/// N-GET-RQ command field code.
pub const N_GET_RQ: u16 = 0x0110;
/// N-SET-RQ command field code.
pub const N_SET_RQ: u16 = 0x0120;
/// N-ACTION-RQ command field code.
pub const N_ACTION_RQ: u16 = 0x0130;
/// N-CREATE-RQ command field code.
pub const N_CREATE_RQ: u16 = 0x0140;
/// N-DELETE-RQ command field code.
pub const N_DELETE_RQ: u16 = 0x0150;
/// C-CANCEL-RQ command field code.
pub const C_CANCEL_RQ: u16 = 0x0FFF;

/// Bit set in the command field of every response primitive.
pub const RSP_BIT: u16 = 0x8000;

/// _Command Data Set Type_ value indicating that a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0000;
/// _Command Data Set Type_ value indicating that no data set follows.
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// Medium operation priority.
pub const PRIORITY_MEDIUM: u16 = 0x0000;
/// High operation priority.
pub const PRIORITY_HIGH: u16 = 0x0001;
/// Low operation priority.
pub const PRIORITY_LOW: u16 = 0x0002;

/// The kind of a DIMSE request primitive,
/// the key under which services declare their capabilities.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DimseKind {
    CEcho,
    CStore,
    CFind,
    CGet,
    CMove,
    NEventReport,
    NGet,
    NSet,
    NAction,
    NCreate,
    NDelete,
}

impl DimseKind {
    /// Classify a request command field code.
    ///
    /// Returns `None` for response codes, C-CANCEL-RQ,
    /// and unknown values.
    pub fn from_command_field(field: u16) -> Option<Self> {
        match field {
            C_STORE_RQ => Some(DimseKind::CStore),
            C_GET_RQ => Some(DimseKind::CGet),
            C_FIND_RQ => Some(DimseKind::CFind),
            C_MOVE_RQ => Some(DimseKind::CMove),
            C_ECHO_RQ => Some(DimseKind::CEcho),
            N_EVENT_REPORT_RQ => Some(DimseKind::NEventReport),
            N_GET_RQ => Some(DimseKind::NGet),
            N_SET_RQ => Some(DimseKind::NSet),
            N_ACTION_RQ => Some(DimseKind::NAction),
            N_CREATE_RQ => Some(DimseKind::NCreate),
            N_DELETE_RQ => Some(DimseKind::NDelete),
            _ => None,
        }
    }

    /// The request command field code of this kind.
    pub fn rq_field(self) -> u16 {
        match self {
            DimseKind::CStore => C_STORE_RQ,
            DimseKind::CGet => C_GET_RQ,
            DimseKind::CFind => C_FIND_RQ,
            DimseKind::CMove => C_MOVE_RQ,
            DimseKind::CEcho => C_ECHO_RQ,
            DimseKind::NEventReport => N_EVENT_REPORT_RQ,
            DimseKind::NGet => N_GET_RQ,
            DimseKind::NSet => N_SET_RQ,
            DimseKind::NAction => N_ACTION_RQ,
            DimseKind::NCreate => N_CREATE_RQ,
            DimseKind::NDelete => N_DELETE_RQ,
        }
    }

    /// The response command field code of this kind.
    pub fn rsp_field(self) -> u16 {
        self.rq_field() | RSP_BIT
    }

    /// The tag under which the request carries its SOP class UID.
    ///
    /// Composite primitives and N-CREATE/N-EVENT-REPORT use
    /// _Affected SOP Class UID_; the remaining normalized primitives
    /// use _Requested SOP Class UID_.
    pub fn sop_class_uid_tag(self) -> dicom_core::Tag {
        match self {
            DimseKind::NGet | DimseKind::NSet | DimseKind::NAction | DimseKind::NDelete => {
                tags::REQUESTED_SOP_CLASS_UID
            }
            _ => tags::AFFECTED_SOP_CLASS_UID,
        }
    }
}

/// Read the _Command Field_ of a command set.
pub fn command_field(cmd: &InMemDicomObject) -> Result<u16, ServiceError> {
    cmd.element(tags::COMMAND_FIELD)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .ok_or_else(|| {
            ServiceError::with_comment(status::MISTYPED_ARGUMENT, "Missing Command Field")
                .offending_elements([tags::COMMAND_FIELD])
        })
}

/// Read the _Message ID_ of a request command set.
pub fn message_id(cmd: &InMemDicomObject) -> Result<u16, ServiceError> {
    cmd.element(tags::MESSAGE_ID)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .ok_or_else(|| {
            ServiceError::with_comment(status::MISTYPED_ARGUMENT, "Missing Message ID")
                .offending_elements([tags::MESSAGE_ID])
        })
}

/// Read the SOP class UID of a request of the given kind.
pub fn sop_class_uid(kind: DimseKind, cmd: &InMemDicomObject) -> Result<String, ServiceError> {
    let tag = kind.sop_class_uid_tag();
    cmd.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|uid| uid.trim_end_matches('\0').to_string())
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| {
            ServiceError::with_comment(status::MISTYPED_ARGUMENT, "Missing SOP Class UID")
                .offending_elements([tag])
        })
}

/// Read the operation priority, defaulting to medium.
pub fn priority(cmd: &InMemDicomObject) -> u16 {
    cmd.element(tags::PRIORITY)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .unwrap_or(PRIORITY_MEDIUM)
}

/// Read the _Move Destination_ AE title of a C-MOVE-RQ.
pub fn move_destination(cmd: &InMemDicomObject) -> Result<String, ServiceError> {
    cmd.element(tags::MOVE_DESTINATION)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|aet| aet.trim().to_string())
        .filter(|aet| !aet.is_empty())
        .ok_or_else(|| {
            ServiceError::with_comment(status::MISTYPED_ARGUMENT, "Missing Move Destination")
                .offending_elements([tags::MOVE_DESTINATION])
        })
}

/// Whether the command set announces an accompanying data set.
pub fn has_data_set(cmd: &InMemDicomObject) -> bool {
    cmd.element(tags::COMMAND_DATA_SET_TYPE)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .map(|v| v != DATA_SET_ABSENT)
        .unwrap_or(false)
}

/// Sub-operation progress counters reported in C-GET/C-MOVE responses.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SubOpCounts {
    pub remaining: Option<u16>,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// Builder for a DIMSE response command set.
#[derive(Debug)]
pub struct RspCommand {
    kind: DimseKind,
    sop_class_uid: String,
    message_id: u16,
    status: u16,
    sop_instance_uid: Option<String>,
    counts: Option<SubOpCounts>,
    with_data_set: bool,
}

impl RspCommand {
    /// Start a response to a request of the given kind.
    pub fn new(kind: DimseKind, sop_class_uid: impl Into<String>, message_id: u16) -> Self {
        RspCommand {
            kind,
            sop_class_uid: sop_class_uid.into(),
            message_id,
            status: status::SUCCESS,
            sop_instance_uid: None,
            counts: None,
            with_data_set: false,
        }
    }

    /// Set the response status code.
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set the _Affected SOP Instance UID_.
    pub fn sop_instance_uid(mut self, uid: impl Into<String>) -> Self {
        self.sop_instance_uid = Some(uid.into());
        self
    }

    /// Report sub-operation progress counters.
    pub fn counts(mut self, counts: SubOpCounts) -> Self {
        self.counts = Some(counts);
        self
    }

    /// Announce that a data set follows the command set.
    pub fn with_data_set(mut self, with_data_set: bool) -> Self {
        self.with_data_set = with_data_set;
        self
    }

    /// Build the response command set.
    ///
    /// All elements are collected before construction so that the
    /// command group length computed by
    /// [`InMemDicomObject::command_from_element_iter`] accounts for
    /// every one of them.
    pub fn build(self) -> InMemDicomObject {
        self.build_with(None)
    }

    /// Build a response command set reporting a service failure,
    /// taking the status and descriptive fields from the error.
    pub fn build_error(mut self, error: &ServiceError) -> InMemDicomObject {
        self.status = error.status();
        self.with_data_set = error.data_set().is_some();
        self.build_with(Some(error))
    }

    fn build_with(self, error: Option<&ServiceError>) -> InMemDicomObject {
        let data_set_type = if self.with_data_set {
            DATA_SET_PRESENT
        } else {
            DATA_SET_ABSENT
        };
        let mut elements = vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(self.sop_class_uid.as_str()),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.kind.rsp_field()]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [data_set_type]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
        ];
        if let Some(uid) = &self.sop_instance_uid {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(uid.as_str()),
            ));
        }
        if let Some(counts) = self.counts {
            if let Some(remaining) = counts.remaining {
                elements.push(DataElement::new(
                    tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                    VR::US,
                    dicom_value!(U16, [remaining]),
                ));
            }
            elements.push(DataElement::new(
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [counts.completed]),
            ));
            elements.push(DataElement::new(
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [counts.failed]),
            ));
            elements.push(DataElement::new(
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [counts.warning]),
            ));
        }
        if let Some(error) = error {
            if let Some(comment) = error.error_comment() {
                // LO limits the comment to 64 characters
                let end = comment
                    .char_indices()
                    .map(|(i, _)| i)
                    .nth(64)
                    .unwrap_or(comment.len());
                let comment = &comment[..end];
                elements.push(DataElement::new(
                    tags::ERROR_COMMENT,
                    VR::LO,
                    PrimitiveValue::from(comment),
                ));
            }
            if !error.offending().is_empty() {
                elements.push(DataElement::new(
                    tags::OFFENDING_ELEMENT,
                    VR::AT,
                    PrimitiveValue::Tags(error.offending().iter().copied().collect()),
                ));
            }
        }
        InMemDicomObject::command_from_element_iter(elements)
    }
}

/// Build a C-STORE-RQ command set for a sub-operation or batch store.
pub fn store_rq(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
    priority: u16,
    originator: Option<(&str, u16)>,
) -> InMemDicomObject {
    let mut elements = vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
    ];
    if let Some((aet, moved_message_id)) = originator {
        elements.push(DataElement::new(
            tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
            VR::AE,
            PrimitiveValue::from(aet),
        ));
        elements.push(DataElement::new(
            tags::MOVE_ORIGINATOR_MESSAGE_ID,
            VR::US,
            dicom_value!(U16, [moved_message_id]),
        ));
    }
    InMemDicomObject::command_from_element_iter(elements)
}
