//! Metadata record advertised alongside a piece of content.

use crate::content_id::ContentId;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Maximum length accepted for a file description.
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Maximum length accepted for a wallet address.
pub const MAX_WALLET_ADDRESS_LEN: usize = 256;

/// Whether `price` reads back unchanged after being written as a JSON number.
///
/// Prices cross the wire and the ledger as `f64`, so values needing more than
/// about 15 significant digits would be rounded.
pub fn price_is_representable(price: Decimal) -> bool {
    price
        .to_f64()
        .and_then(|float| Decimal::from_str(&float.to_string()).ok())
        .is_some_and(|back| back == price)
}

/// Descriptive record for one advertised file.
///
/// Wire field names are shared with the web client and other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub cid: ContentId,

    #[serde(rename = "fileDescription", default)]
    pub description: String,

    /// Asking price, emitted as a JSON number.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,

    /// Location of the file on the advertising node.
    #[serde(rename = "filepath")]
    pub file_path: PathBuf,

    /// Opaque payment address. Never interpreted by the node.
    #[serde(rename = "walletaddress", default)]
    pub wallet_address: String,
}

impl MetadataRecord {
    pub fn new(
        cid: ContentId,
        description: impl Into<String>,
        price: Decimal,
        file_path: impl Into<PathBuf>,
        wallet_address: impl Into<String>,
    ) -> Self {
        Self {
            cid,
            description: description.into(),
            price,
            file_path: file_path.into(),
            wallet_address: wallet_address.into(),
        }
    }

    /// Validate the record fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.price < Decimal::ZERO {
            return Err(format!("price must not be negative, got {}", self.price));
        }

        if !price_is_representable(self.price) {
            return Err(format!(
                "price {} cannot be stored without rounding",
                self.price
            ));
        }

        if !self.file_path.is_absolute() {
            return Err(format!(
                "file path must be absolute, got {}",
                self.file_path.display()
            ));
        }

        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "description too long (max {MAX_DESCRIPTION_LEN} bytes)"
            ));
        }

        if self.wallet_address.len() > MAX_WALLET_ADDRESS_LEN {
            return Err(format!(
                "wallet address too long (max {MAX_WALLET_ADDRESS_LEN} bytes)"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(price: &str) -> MetadataRecord {
        MetadataRecord::new(
            ContentId::from_data(b"sample").unwrap(),
            "holiday photos",
            Decimal::from_str(price).unwrap(),
            std::env::temp_dir().join("photos.tar"),
            "wallet-1",
        )
    }

    #[test]
    fn wire_names_match_the_ledger_format() {
        let record = sample("2.50");
        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object["cid"], record.cid.to_string());
        assert_eq!(object["fileDescription"], "holiday photos");
        assert_eq!(object["price"].as_f64(), Some(2.5));
        assert_eq!(object["walletaddress"], "wallet-1");
        assert!(object.contains_key("filepath"));
        assert_eq!(object.len(), 5);
    }

    #[test]
    fn decodes_records_written_by_other_nodes() {
        let cid = ContentId::from_data(b"remote").unwrap();
        let json = format!(
            r#"{{"cid":"{cid}","fileDescription":"x","price":0.75,"filepath":"/srv/x","walletaddress":"w","extra":true}}"#
        );
        let record: MetadataRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.cid, cid);
        assert_eq!(record.price, Decimal::from_str("0.75").unwrap());
        assert_eq!(record.file_path, PathBuf::from("/srv/x"));
    }

    #[test]
    fn validate_rejects_negative_price() {
        let record = sample("-1");
        assert!(record.validate().is_err());
        assert!(sample("0").validate().is_ok());
    }

    #[test]
    fn validate_rejects_prices_that_would_be_rounded() {
        let err = sample("12345678901234567.89").validate().unwrap_err();
        assert!(err.contains("rounding"));
        assert!(sample("0.1").validate().is_ok());
        assert!(sample("2.50").validate().is_ok());
        assert!(sample("1999.99").validate().is_ok());
    }

    #[test]
    fn validate_rejects_relative_path() {
        let mut record = sample("1");
        record.file_path = PathBuf::from("relative/file.bin");
        let err = record.validate().unwrap_err();
        assert!(err.contains("absolute"));
    }
}
