use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;

use crate::config::OwnerCredentials;
use crate::http::error::ApiError;

/// Checks the Basic-auth credential pair required to create a store that
/// does not yet exist on disk. Every other endpoint authenticates per file
/// through nonce signatures instead.
pub fn check_store_owner(
    auth: Option<&Authorization<Basic>>,
    expected: Option<&OwnerCredentials>,
) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::Unauthorized(
            "store creation requires owner credentials, but none are configured".to_string(),
        ));
    };
    let Some(auth) = auth else {
        return Err(ApiError::Unauthorized(
            "store creation requires basic authentication".to_string(),
        ));
    };
    if auth.username() != expected.username || auth.password() != expected.password {
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> OwnerCredentials {
        OwnerCredentials {
            username: "publisher".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn accepts_matching_pair() {
        let auth = Authorization::basic("publisher", "hunter2");
        assert!(check_store_owner(Some(&auth), Some(&credentials())).is_ok());
    }

    #[test]
    fn rejects_missing_and_mismatched() {
        assert!(check_store_owner(None, Some(&credentials())).is_err());

        let wrong = Authorization::basic("publisher", "wrong");
        assert!(check_store_owner(Some(&wrong), Some(&credentials())).is_err());

        let auth = Authorization::basic("publisher", "hunter2");
        assert!(check_store_owner(Some(&auth), None).is_err());
    }
}
