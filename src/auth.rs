//! Caller identity. Release and retirement mutate history other callers
//! depend on, so they require elevated privilege; everything else runs
//! as standard.

use crate::engine::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Standard,
    Elevated,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub privilege: Privilege,
}

impl Identity {
    pub fn standard(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privilege: Privilege::Standard,
        }
    }

    pub fn elevated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privilege: Privilege::Elevated,
        }
    }

    pub fn ensure_elevated(&self) -> Result<(), EngineError> {
        match self.privilege {
            Privilege::Elevated => Ok(()),
            Privilege::Standard => Err(EngineError::Unauthorized(
                "elevated privilege required",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_identity_is_not_elevated() {
        assert!(Identity::standard("alice").ensure_elevated().is_err());
        assert!(Identity::elevated("ops").ensure_elevated().is_ok());
    }
}
