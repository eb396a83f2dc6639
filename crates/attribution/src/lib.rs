//! Attribution: UTM and click-ID extraction from request body and URLs,
//! attribution summaries, and form-field name normalization.

mod forms;
mod utm;

pub use forms::{form_fields_from_url, normalize_field_name, normalize_form_map};
pub use utm::{is_tracking_param, AttributionSummary, UtmData, TRACKING_PARAMS};
