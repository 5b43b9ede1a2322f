//! DIMSE status code constants and classification predicates.
//!
//! Values are the 16-bit codes carried in the _Status_ (0000,0900)
//! element of a DIMSE response command set.

/// The operation completed without errors.
pub const SUCCESS: u16 = 0x0000;

/// More responses follow; matches or sub-operations are still being
/// processed.
pub const PENDING: u16 = 0xFF00;

/// More responses follow, but one or more optional keys in the request
/// were not supported for matching.
pub const PENDING_WARNING: u16 = 0xFF01;

/// The operation was terminated by a C-CANCEL request.
pub const CANCEL: u16 = 0xFE00;

/// One or more sub-operations failed, the rest completed.
pub const ONE_OR_MORE_FAILURES: u16 = 0xB000;

/// Coercion of data elements was performed.
pub const COERCION_OF_DATA_ELEMENTS: u16 = 0xB000;

/// Out of resources.
pub const OUT_OF_RESOURCES: u16 = 0xA700;

/// Out of resources: unable to calculate the number of matches.
pub const UNABLE_TO_CALCULATE_NUMBER_OF_MATCHES: u16 = 0xA701;

/// Out of resources: unable to perform sub-operations.
pub const UNABLE_TO_PERFORM_SUB_OPERATIONS: u16 = 0xA702;

/// The move destination AE title is not known to this node.
pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;

/// The identifier does not match the negotiated SOP class.
pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;

/// A general failure in processing the operation.
pub const PROCESSING_FAILURE: u16 = 0x0110;

/// An attribute value was out of range or otherwise inappropriate.
pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;

/// A required attribute was not present in the identifier or dataset.
pub const MISSING_ATTRIBUTE: u16 = 0x0120;

/// A required attribute was present but had no value.
pub const MISSING_ATTRIBUTE_VALUE: u16 = 0x0121;

/// The attribute is not part of the SOP instance.
pub const NO_SUCH_ATTRIBUTE: u16 = 0x0105;

/// The SOP class is not supported (also reported as _no such SOP class_).
pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;

/// The SOP instance was not recognized.
pub const NO_SUCH_OBJECT_INSTANCE: u16 = 0x0112;

/// The same message ID was used for an operation still in progress.
pub const DUPLICATE_INVOCATION: u16 = 0x0210;

/// The operation is not one of those agreed between the peers.
pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// A parameter of the operation was of the wrong type.
pub const MISTYPED_ARGUMENT: u16 = 0x0212;

/// Whether the status signals that further responses follow.
pub fn is_pending(status: u16) -> bool {
    matches!(status, PENDING | PENDING_WARNING)
}

/// Whether the status is in the warning class.
///
/// Besides the 0xBxxx range shared with sub-operation warnings,
/// the codes 0x0001 and 0x01xx–0x02xx (excluding the failure codes
/// defined above) are warnings for some services; only the forms
/// relevant to composite services are recognized here.
pub fn is_warning(status: u16) -> bool {
    status == 0x0001 || (status & 0xB000) == 0xB000
}

/// Whether the status is terminal and signals failure.
pub fn is_failure(status: u16) -> bool {
    status != SUCCESS && status != CANCEL && !is_pending(status) && !is_warning(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_codes() {
        assert!(is_pending(PENDING));
        assert!(is_pending(PENDING_WARNING));
        assert!(!is_pending(SUCCESS));
        assert!(!is_pending(CANCEL));
    }

    #[test]
    fn warning_range() {
        assert!(is_warning(0xB000));
        assert!(is_warning(0xB007));
        assert!(is_warning(0xBFFF));
        assert!(is_warning(0x0001));
        assert!(!is_warning(0xA702));
        assert!(!is_warning(SUCCESS));
    }

    #[test]
    fn failure_classification() {
        assert!(is_failure(UNABLE_TO_PERFORM_SUB_OPERATIONS));
        assert!(is_failure(IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS));
        assert!(is_failure(SOP_CLASS_NOT_SUPPORTED));
        assert!(is_failure(PROCESSING_FAILURE));
        assert!(!is_failure(SUCCESS));
        assert!(!is_failure(CANCEL));
        assert!(!is_failure(PENDING));
        assert!(!is_failure(ONE_OR_MORE_FAILURES));
    }
}
