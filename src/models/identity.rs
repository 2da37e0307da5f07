use serde::{Deserialize, Serialize};

/// A database identity a catalog operation acts as.
///
/// Authentication happens outside the catalog; callers hand in an identity
/// they have already established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub superuser: bool,
}

impl Identity {
    /// An ordinary, non-elevated identity.
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superuser: false,
        }
    }

    /// An identity holding administrator privilege.
    pub fn superuser(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superuser: true,
        }
    }

    /// Case-insensitive match against a stored user name.
    pub fn is_named(&self, user_name: &str) -> bool {
        self.name.eq_ignore_ascii_case(user_name)
    }
}
