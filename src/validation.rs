use alloy_primitives::Address;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid Ethereum address format: {0}")]
    InvalidEthereumAddress(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Parses a 0x-prefixed 20-byte hex address. Mixed-case input must carry a
/// valid EIP-55 checksum; all-lower and all-upper input is accepted as is.
pub fn validate_ethereum_address(address: &str) -> Result<Address, ValidationError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ValidationError::MissingParameter("address".to_string()));
    }

    if !address.starts_with("0x") || address.len() != 42 {
        return Err(ValidationError::InvalidEthereumAddress(address.to_string()));
    }

    let digits = &address[2..];
    let mixed_case = digits.chars().any(|c| c.is_ascii_lowercase())
        && digits.chars().any(|c| c.is_ascii_uppercase());

    if mixed_case {
        Address::parse_checksummed(address, None)
            .map_err(|_| ValidationError::InvalidEthereumAddress(address.to_string()))
    } else {
        Address::from_str(address)
            .map_err(|_| ValidationError::InvalidEthereumAddress(address.to_string()))
    }
}

/// Lower-cased form used for tracked-address bookkeeping and document ids
pub fn normalize_address(address: &str) -> Result<String, ValidationError> {
    validate_ethereum_address(address).map(|a| a.to_string().to_lowercase())
}

pub fn checksum_address(address: &Address) -> String {
    address.to_checksum(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_lower_case_and_checksummed_addresses() {
        let lower = "0x52908400098527886e0f7030069857d2e4169ee7";
        let checksummed = "0x52908400098527886E0F7030069857D2E4169EE7";

        assert_eq!(
            validate_ethereum_address(lower).unwrap(),
            validate_ethereum_address(checksummed).unwrap()
        );
        assert_eq!(normalize_address(checksummed).unwrap(), lower);
    }

    #[test]
    fn rejects_bad_checksum_and_bad_length() {
        assert!(validate_ethereum_address("0x52908400098527886E0F7030069857D2E4169Ee7").is_err());
        assert!(validate_ethereum_address("0x1234").is_err());
        assert!(matches!(
            validate_ethereum_address("  "),
            Err(ValidationError::MissingParameter(_))
        ));
    }

    #[test]
    fn checksum_round_trips() {
        let address = validate_ethereum_address("0xde709f2102306220921060314715629080e2fb77").unwrap();
        assert_eq!(
            checksum_address(&address),
            "0xde709f2102306220921060314715629080e2fb77"
        );
    }
}
