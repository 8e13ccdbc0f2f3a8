//! Column schema for the patents table view.
//!
//! The schema is the source of truth the preference reconciler validates
//! persisted display state against: unknown keys are dropped, newly added
//! default-visible columns surface automatically.

/// One displayable column of patent data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Stable key, matches the patents table column where one exists.
    pub key: &'static str,
    pub header: &'static str,
    /// Default width in pixels.
    pub width: u32,
    pub default_visible: bool,
    pub category: &'static str,
}

pub const PATENT_COLUMNS: &[ColumnSpec] = &[
    // Core fields (visible by default)
    ColumnSpec { key: "app_number", header: "Application #", width: 110, default_visible: true, category: "Core" },
    ColumnSpec { key: "title", header: "Title", width: 280, default_visible: true, category: "Core" },
    ColumnSpec { key: "current_status", header: "Status", width: 180, default_visible: true, category: "Core" },
    ColumnSpec { key: "status_date", header: "Status Date", width: 95, default_visible: true, category: "Core" },
    ColumnSpec { key: "patent_number", header: "Patent #", width: 90, default_visible: true, category: "Core" },
    ColumnSpec { key: "expiration_date", header: "Expiration", width: 95, default_visible: true, category: "Core" },
    ColumnSpec { key: "applicant", header: "Applicant", width: 150, default_visible: true, category: "Core" },
    ColumnSpec { key: "examiner", header: "Examiner", width: 130, default_visible: true, category: "Core" },
    // Dates
    ColumnSpec { key: "filing_date", header: "Filing Date", width: 95, default_visible: false, category: "Dates" },
    ColumnSpec { key: "grant_date", header: "Grant Date", width: 95, default_visible: false, category: "Dates" },
    ColumnSpec { key: "publication_date", header: "Pub Date", width: 95, default_visible: false, category: "Dates" },
    ColumnSpec { key: "effective_filing_date", header: "Eff. Filing", width: 95, default_visible: false, category: "Dates" },
    // Identifiers
    ColumnSpec { key: "publication_number", header: "Publication #", width: 140, default_visible: false, category: "Identifiers" },
    ColumnSpec { key: "docket_number", header: "Docket #", width: 150, default_visible: false, category: "Identifiers" },
    ColumnSpec { key: "customer_number", header: "Customer #", width: 90, default_visible: false, category: "Identifiers" },
    ColumnSpec { key: "confirmation_number", header: "Confirm #", width: 90, default_visible: false, category: "Identifiers" },
    // Classification
    ColumnSpec { key: "art_unit", header: "Art Unit", width: 80, default_visible: false, category: "Classification" },
    ColumnSpec { key: "entity_status", header: "Entity", width: 80, default_visible: false, category: "Classification" },
    ColumnSpec { key: "application_type_label", header: "App Type", width: 90, default_visible: false, category: "Classification" },
    ColumnSpec { key: "first_inventor_to_file", header: "FITF", width: 60, default_visible: false, category: "Classification" },
    // People
    ColumnSpec { key: "inventor", header: "Inventor", width: 150, default_visible: false, category: "People" },
    // Patent term
    ColumnSpec { key: "pta_total_days", header: "PTA Days", width: 80, default_visible: false, category: "Patent Term" },
];

/// Keys of the columns that are visible on a fresh install.
pub fn default_visible(columns: &[ColumnSpec]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| c.default_visible)
        .map(|c| c.key.to_string())
        .collect()
}

/// Look up a column by key.
pub fn find_column<'a>(columns: &'a [ColumnSpec], key: &str) -> Option<&'a ColumnSpec> {
    columns.iter().find(|c| c.key == key)
}
