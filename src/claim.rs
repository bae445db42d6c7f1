//! Parsing of scanned payloads into access claims.
//!
//! A payload is the decoded text of a visual code, formatted as
//! `<code>:<uid>:<issuer>`. There is no escaping, so a field containing the
//! separator makes the payload malformed.

/// Separator between the fields of a scan payload.
pub const SEPARATOR: char = ':';

const FIELDS: [&str; 3] = ["code", "uid", "issuer"];

#[derive(Clone, Debug, PartialEq, Eq)]
/// The structured form of a scanned payload, before any trust decision is made.
pub struct AccessClaim {
    /// The submitted one-time code
    pub code: String,
    /// User id, unique within the issuer
    pub uid: String,
    /// Tenant the user belongs to
    pub issuer: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
/// Every variant is a malformed payload; the variants only say why.
pub enum ParseError {
    #[error("expected 3 fields separated by '{sep}', found {0}", sep = SEPARATOR)]
    FieldCount(usize),
    #[error("empty {0} field")]
    EmptyField(&'static str),
}

/// Splits `raw` into a claim. Pure; never touches the directory.
pub fn parse(raw: &str) -> Result<AccessClaim, ParseError> {
    let fields: Vec<&str> = raw.split(SEPARATOR).collect();
    if fields.len() != FIELDS.len() {
        return Err(ParseError::FieldCount(fields.len()));
    }
    if let Some(position) = fields.iter().position(|field| field.is_empty()) {
        return Err(ParseError::EmptyField(FIELDS[position]));
    }

    Ok(AccessClaim {
        code: fields[0].into(),
        uid: fields[1].into(),
        issuer: fields[2].into(),
    })
}

impl AccessClaim {
    pub fn new(code: impl Into<String>, uid: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self { code: code.into(), uid: uid.into(), issuer: issuer.into() }
    }

    /// Renders the claim in scan payload format.
    pub fn payload(&self) -> String {
        format!("{}{sep}{}{sep}{}", self.code, self.uid, self.issuer, sep = SEPARATOR)
    }
}

impl core::str::FromStr for AccessClaim {
    type Err = ParseError;
    fn from_str(raw: &str) -> Result<Self, ParseError> {
        parse(raw)
    }
}
