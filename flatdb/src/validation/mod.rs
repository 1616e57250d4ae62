use crate::document::Document;
use crate::error::{FlatDbError, Result};

/// Issues found while validating a document
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// An external check run on every document before it is stored.
///
/// Implemented for any `Fn(&Document, &mut ValidationResult)`.
pub trait Validator {
    fn validate(&self, document: &Document, result: &mut ValidationResult);
}

impl<F> Validator for F
where
    F: Fn(&Document, &mut ValidationResult),
{
    fn validate(&self, document: &Document, result: &mut ValidationResult) {
        self(document, result)
    }
}

/// Run `validator` on `document`.
/// In strict mode errors reject the document; otherwise they are logged as
/// warnings and the document is accepted. Returns the warnings.
pub fn check(
    validator: &dyn Validator,
    document: &Document,
    strict: bool,
) -> Result<Vec<String>> {
    let mut result = ValidationResult::default();
    validator.validate(document, &mut result);

    if !strict {
        result.warnings.append(&mut result.errors);
    }

    if !result.is_ok() {
        return Err(FlatDbError::Validation(format!(
            "Document validation failed:\n  - {}",
            result.errors.join("\n  - ")
        )));
    }

    if result.has_warnings() {
        for warning in &result.warnings {
            log::warn!("Validation warning: {warning}");
        }
    }
    Ok(result.warnings)
}
