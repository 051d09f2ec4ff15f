//! Results document validation and traversal.
//!
//! Incoming documents must conform to the fixed results schema:
//!
//! ```xml
//! <testresults version="1.0">
//!   <suite name="sanity-suite">
//!     <set name="boot-set">
//!       <case name="test_boot" result="PASS"/>
//!       <case name="test_leds" result="FAIL" insignificant="true"/>
//!     </set>
//!   </suite>
//! </testresults>
//! ```
//!
//! The document is walked exactly once, in pre-order, dispatching each
//! element name through a fixed handler table. Element names without a
//! registered handler are no-ops, which lets newer workers add elements
//! without breaking older orchestrators. Known elements are validated
//! strictly; any violation is a [`SchemaValidationError`] and the whole
//! document is excluded from aggregation.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{CaseResult, CaseVerdict, PackageResults};
use crate::environment::Environment;

/// Root element every results document must have.
const ROOT_ELEMENT: &str = "testresults";

/// A results document that does not conform to the results schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaValidationError {
    /// The document is not well-formed XML.
    #[error("document is not well-formed XML: {0}")]
    Malformed(String),

    /// The document's root element is not `testresults`.
    #[error("unexpected root element '{0}', expected '{ROOT_ELEMENT}'")]
    UnexpectedRoot(String),

    /// A known element lacks one of its mandatory attributes.
    #[error("element '{element}' is missing mandatory attribute '{attribute}'")]
    MissingAttribute {
        /// The offending element name.
        element: String,
        /// The absent attribute.
        attribute: String,
    },

    /// A known attribute carries a value outside its allowed set.
    #[error("invalid value '{value}' for attribute '{attribute}' on element '{element}'")]
    InvalidAttribute {
        /// The offending element name.
        element: String,
        /// The offending attribute.
        attribute: String,
        /// The rejected value.
        value: String,
    },
}

/// Validates and walks one document, classifying its cases.
///
/// # Errors
///
/// [`SchemaValidationError`] on the first violation encountered; nothing of
/// the partially-walked document escapes.
pub fn parse_document(
    package: &str,
    environment: &Environment,
    content: &str,
) -> Result<PackageResults, SchemaValidationError> {
    let mut walk = Walk {
        results: PackageResults::new(package, environment.clone()),
        root_seen: false,
    };

    let mut reader = Reader::from_str(content);
    loop {
        match reader.read_event() {
            Err(e) => return Err(SchemaValidationError::Malformed(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                walk.element(&element)?;
            }
            // Text, comments, processing instructions and end tags carry no
            // schema obligations.
            Ok(_) => {}
        }
    }

    if !walk.root_seen {
        return Err(SchemaValidationError::Malformed(
            "document has no root element".to_string(),
        ));
    }

    Ok(walk.results)
}

struct Walk {
    results: PackageResults,
    root_seen: bool,
}

type Handler = fn(&mut Walk, &BytesStart<'_>) -> Result<(), SchemaValidationError>;

/// Element-name → handler table, fixed at compile time.
const DISPATCH: &[(&[u8], Handler)] = &[
    (b"testresults", Walk::testresults),
    (b"suite", Walk::suite),
    (b"set", Walk::set),
    (b"case", Walk::case),
];

fn handler_for(name: &[u8]) -> Option<Handler> {
    DISPATCH
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, handler)| *handler)
}

impl Walk {
    fn element(&mut self, element: &BytesStart<'_>) -> Result<(), SchemaValidationError> {
        let name = element.local_name();
        if !self.root_seen && name.as_ref() != ROOT_ELEMENT.as_bytes() {
            return Err(SchemaValidationError::UnexpectedRoot(
                String::from_utf8_lossy(name.as_ref()).into_owned(),
            ));
        }

        match handler_for(name.as_ref()) {
            Some(handler) => handler(self, element),
            // Unregistered element: forward-compatible no-op.
            None => Ok(()),
        }
    }

    fn testresults(&mut self, element: &BytesStart<'_>) -> Result<(), SchemaValidationError> {
        require_attr(element, ROOT_ELEMENT, "version")?;
        self.root_seen = true;
        Ok(())
    }

    fn suite(&mut self, element: &BytesStart<'_>) -> Result<(), SchemaValidationError> {
        require_attr(element, "suite", "name")?;
        Ok(())
    }

    fn set(&mut self, element: &BytesStart<'_>) -> Result<(), SchemaValidationError> {
        require_attr(element, "set", "name")?;
        Ok(())
    }

    fn case(&mut self, element: &BytesStart<'_>) -> Result<(), SchemaValidationError> {
        let name = require_attr(element, "case", "name")?;
        let result = require_attr(element, "case", "result")?;
        let verdict: CaseVerdict =
            result
                .parse()
                .map_err(|()| SchemaValidationError::InvalidAttribute {
                    element: "case".to_string(),
                    attribute: "result".to_string(),
                    value: result.clone(),
                })?;

        let insignificant = match attr(element, "insignificant")? {
            None => false,
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            Some(value) => {
                return Err(SchemaValidationError::InvalidAttribute {
                    element: "case".to_string(),
                    attribute: "insignificant".to_string(),
                    value,
                });
            }
        };

        self.results.push(CaseResult {
            name,
            verdict,
            insignificant,
        });
        Ok(())
    }
}

fn attr(
    element: &BytesStart<'_>,
    name: &str,
) -> Result<Option<String>, SchemaValidationError> {
    let attribute = element
        .try_get_attribute(name)
        .map_err(|e| SchemaValidationError::Malformed(e.to_string()))?;
    match attribute {
        Some(attribute) => {
            let value = attribute
                .unescape_value()
                .map_err(|e| SchemaValidationError::Malformed(e.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn require_attr(
    element: &BytesStart<'_>,
    element_name: &str,
    name: &str,
) -> Result<String, SchemaValidationError> {
    attr(element, name)?.ok_or_else(|| SchemaValidationError::MissingAttribute {
        element: element_name.to_string(),
        attribute: name.to_string(),
    })
}
