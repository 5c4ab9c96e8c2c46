use std::collections::BTreeMap;
use std::fmt;

use facet::Facet;

use crate::error::ProvisionError;

/// Result of a successful build: the VM that was left behind.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Artifact {
    pub vm_name: String,
    pub uuid: String,
    /// `VMName`, `OSVersion` and `DarwinVersion` when the guest was reachable.
    pub generated: BTreeMap<String, String>,
}

impl Artifact {
    pub fn id(&self) -> &str {
        &self.uuid
    }

    pub fn to_json(&self) -> Result<String, ProvisionError> {
        facet_json::to_string(self).map_err(|e| ProvisionError::Protocol {
            message: format!("cannot serialize artifact: {e}"),
        })
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Anka VM {} ({})", self.vm_name, self.uuid)?;
        for (key, value) in &self.generated {
            write!(f, "\n  {key}: {value}")?;
        }
        Ok(())
    }
}
