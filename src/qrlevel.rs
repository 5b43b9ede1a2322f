//! Query/retrieve level handling and identifier validation.
//!
//! The _Query/Retrieve Level_ (0008,0052) of a C-FIND, C-GET, or C-MOVE
//! identifier selects the level of the information model being addressed.
//! Validation enforces the unique key requirements of the declared level
//! against the information model root and the negotiated relational
//! behavior before a query or retrieve task is started.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use crate::error::ServiceError;
use crate::status;

/// A level of the query/retrieve information model.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueryRetrieveLevel {
    Patient,
    Study,
    Series,
    Image,
    Frame,
}

impl QueryRetrieveLevel {
    /// Read and decode the _Query/Retrieve Level_ of an identifier.
    pub fn from_identifier(identifier: &InMemDicomObject) -> Result<Self, ServiceError> {
        let element = identifier.element(tags::QUERY_RETRIEVE_LEVEL).map_err(|_| {
            ServiceError::with_comment(status::MISSING_ATTRIBUTE, "Missing Query/Retrieve Level")
                .offending_elements([tags::QUERY_RETRIEVE_LEVEL])
        })?;
        let value = element.to_str().unwrap_or_default();
        let value = value.trim();
        if value.is_empty() {
            return Err(ServiceError::with_comment(
                status::MISSING_ATTRIBUTE_VALUE,
                "Missing Query/Retrieve Level",
            )
            .offending_elements([tags::QUERY_RETRIEVE_LEVEL]));
        }
        match value {
            "PATIENT" => Ok(QueryRetrieveLevel::Patient),
            "STUDY" => Ok(QueryRetrieveLevel::Study),
            "SERIES" => Ok(QueryRetrieveLevel::Series),
            "IMAGE" => Ok(QueryRetrieveLevel::Image),
            "FRAME" => Ok(QueryRetrieveLevel::Frame),
            _ => Err(ServiceError::with_comment(
                status::INVALID_ATTRIBUTE_VALUE,
                format!("Invalid Query/Retrieve Level: {}", value),
            )
            .offending_elements([tags::QUERY_RETRIEVE_LEVEL])),
        }
    }

    /// The unique key attribute of this level.
    pub fn unique_key(self) -> Tag {
        match self {
            QueryRetrieveLevel::Patient => tags::PATIENT_ID,
            QueryRetrieveLevel::Study => tags::STUDY_INSTANCE_UID,
            QueryRetrieveLevel::Series => tags::SERIES_INSTANCE_UID,
            QueryRetrieveLevel::Image | QueryRetrieveLevel::Frame => tags::SOP_INSTANCE_UID,
        }
    }

    /// The keyword used in the _Query/Retrieve Level_ element.
    pub fn keyword(self) -> &'static str {
        match self {
            QueryRetrieveLevel::Patient => "PATIENT",
            QueryRetrieveLevel::Study => "STUDY",
            QueryRetrieveLevel::Series => "SERIES",
            QueryRetrieveLevel::Image => "IMAGE",
            QueryRetrieveLevel::Frame => "FRAME",
        }
    }

    /// Validate a C-FIND identifier against the information model.
    ///
    /// `levels` is the ordered list of levels of the model, from root to
    /// most granular. The unique keys of all levels above the declared
    /// one must be present with a single value, unless `relational`
    /// queries were negotiated. Returns the declared level.
    pub fn validate_query_identifier(
        identifier: &InMemDicomObject,
        levels: &[QueryRetrieveLevel],
        relational: bool,
    ) -> Result<Self, ServiceError> {
        let level = Self::from_identifier(identifier)?;
        let index = Self::level_index(level, levels)?;
        for upper in &levels[..index] {
            check_unique_key(identifier, upper.unique_key(), relational, false)?;
        }
        Ok(level)
    }

    /// Validate a C-GET/C-MOVE identifier against the information model.
    ///
    /// In addition to the requirements of
    /// [`validate_query_identifier`](Self::validate_query_identifier),
    /// the unique key of the declared level itself must be present.
    /// Multiple values in that key are accepted only at the most
    /// granular level of the model.
    pub fn validate_retrieve_identifier(
        identifier: &InMemDicomObject,
        levels: &[QueryRetrieveLevel],
        relational: bool,
    ) -> Result<Self, ServiceError> {
        let level = Self::from_identifier(identifier)?;
        let index = Self::level_index(level, levels)?;
        for upper in &levels[..index] {
            check_unique_key(identifier, upper.unique_key(), relational, false)?;
        }
        let deepest = index + 1 == levels.len();
        check_unique_key(identifier, level.unique_key(), false, deepest)?;
        Ok(level)
    }

    fn level_index(
        level: QueryRetrieveLevel,
        levels: &[QueryRetrieveLevel],
    ) -> Result<usize, ServiceError> {
        levels.iter().position(|l| *l == level).ok_or_else(|| {
            ServiceError::with_comment(
                status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS,
                format!("Invalid Query/Retrieve Level: {}", level.keyword()),
            )
            .offending_elements([tags::QUERY_RETRIEVE_LEVEL])
        })
    }
}

/// The levels of the patient root information model.
pub const PATIENT_ROOT_LEVELS: &[QueryRetrieveLevel] = &[
    QueryRetrieveLevel::Patient,
    QueryRetrieveLevel::Study,
    QueryRetrieveLevel::Series,
    QueryRetrieveLevel::Image,
];

/// The levels of the study root information model.
pub const STUDY_ROOT_LEVELS: &[QueryRetrieveLevel] = &[
    QueryRetrieveLevel::Study,
    QueryRetrieveLevel::Series,
    QueryRetrieveLevel::Image,
];

fn check_unique_key(
    identifier: &InMemDicomObject,
    key: Tag,
    optional: bool,
    multiple_allowed: bool,
) -> Result<(), ServiceError> {
    let count = identifier
        .element(key)
        .ok()
        .map(|e| e.value().multiplicity())
        .unwrap_or(0);
    if count == 0 && !optional {
        return Err(ServiceError::with_comment(
            status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS,
            format!("Missing unique key {}", key),
        )
        .offending_elements([key]));
    }
    if count > 1 && !multiple_allowed {
        return Err(ServiceError::with_comment(
            status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS,
            format!("Multiple values in unique key {}", key),
        )
        .offending_elements([key]));
    }
    Ok(())
}
