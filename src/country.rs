use anyhow::{Result, bail};
use async_trait::async_trait;

/// Maps an ICAO 24-bit address to the state it was allocated to
#[async_trait]
pub trait CountryLookup: Send + Sync {
    /// ISO 3166 alpha-2 code, or `None` when the address falls outside every
    /// known allocation block
    async fn determine_country(&self, icao: &str) -> Result<Option<String>>;
}

/// Lookup backed by flydent's ICAO allocation tables
#[derive(Debug, Default)]
pub struct FlydentCountryLookup;

impl FlydentCountryLookup {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CountryLookup for FlydentCountryLookup {
    async fn determine_country(&self, icao: &str) -> Result<Option<String>> {
        let icao = icao.trim();
        if icao.len() != 6 || u32::from_str_radix(icao, 16).is_err() {
            bail!("'{}' is not a 24-bit ICAO address", icao);
        }

        // Parse using flydent with icao24bit=true
        let parser = flydent::Parser::new();
        Ok(parser
            .parse(&icao.to_ascii_uppercase(), false, true)
            .and_then(|entity| match entity {
                flydent::EntityResult::Country { iso2, .. } => Some(iso2),
                flydent::EntityResult::Organization { .. } => None,
            }))
    }
}
