use serde::{Deserialize, Serialize};

/// Account role. Only `Admin` carries the monitoring privilege; `Platform`
/// accounts behave like merchants on the routing side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Buyer,
    Merchant,
    Admin,
    Platform,
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buyer => write!(f, "buyer"),
            Self::Merchant => write!(f, "merchant"),
            Self::Admin => write!(f, "admin"),
            Self::Platform => write!(f, "platform"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buyer" => Ok(Self::Buyer),
            "merchant" => Ok(Self::Merchant),
            "admin" => Ok(Self::Admin),
            "platform" => Ok(Self::Platform),
            other => Err(format!("unknown user role: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_admin_is_admin() {
        assert!(UserRole::Admin.is_admin());
        assert!(!UserRole::Buyer.is_admin());
        assert!(!UserRole::Merchant.is_admin());
        assert!(!UserRole::Platform.is_admin());
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        for role in [UserRole::Buyer, UserRole::Merchant, UserRole::Admin, UserRole::Platform] {
            let parsed: UserRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!("superuser".parse::<UserRole>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&UserRole::Merchant).unwrap();
        assert_eq!(json, "\"merchant\"");
    }
}
