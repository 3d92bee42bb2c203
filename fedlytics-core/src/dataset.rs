// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Participant-held ESG emissions data.
//!
//! These types only ever live inside a client agent. The coordinator sees
//! them as ciphertexts or not at all.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// GHG protocol emission scope selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmissionScope {
    Scope1,
    Scope2,
    Scope3,
    Total,
}

impl EmissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmissionScope::Scope1 => "scope1",
            EmissionScope::Scope2 => "scope2",
            EmissionScope::Scope3 => "scope3",
            EmissionScope::Total => "total",
        }
    }
}

impl fmt::Display for EmissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmissionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scope1" | "scope_1" => Ok(EmissionScope::Scope1),
            "scope2" | "scope_2" => Ok(EmissionScope::Scope2),
            "scope3" | "scope_3" => Ok(EmissionScope::Scope3),
            "total" | "all" => Ok(EmissionScope::Total),
            other => Err(format!("unknown emission scope '{}'", other)),
        }
    }
}

/// One company's reported figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub company_id: String,
    /// Model input features by name
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    /// Direct emissions (tCO2e)
    pub scope1_emissions: f64,
    /// Purchased-energy emissions (tCO2e)
    pub scope2_emissions: f64,
    /// Value-chain emissions (tCO2e)
    pub scope3_emissions: f64,
}

impl EmissionRecord {
    pub fn new(company_id: impl Into<String>, scope1: f64, scope2: f64, scope3: f64) -> Self {
        Self {
            company_id: company_id.into(),
            features: BTreeMap::new(),
            scope1_emissions: scope1,
            scope2_emissions: scope2,
            scope3_emissions: scope3,
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn emissions(&self, scope: EmissionScope) -> f64 {
        match scope {
            EmissionScope::Scope1 => self.scope1_emissions,
            EmissionScope::Scope2 => self.scope2_emissions,
            EmissionScope::Scope3 => self.scope3_emissions,
            EmissionScope::Total => self.total_emissions(),
        }
    }

    pub fn total_emissions(&self) -> f64 {
        self.scope1_emissions + self.scope2_emissions + self.scope3_emissions
    }

    /// Feature values in the given order. Missing features read as zero.
    pub fn feature_vector(&self, names: &[String]) -> Vec<f64> {
        names
            .iter()
            .map(|name| self.features.get(name).copied().unwrap_or(0.0))
            .collect()
    }
}

/// A participant's full local dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientDataset {
    records: Vec<EmissionRecord>,
}

impl ClientDataset {
    pub fn new(records: Vec<EmissionRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: EmissionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EmissionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Generate a plausible dataset for simulated participants.
    ///
    /// Features are on unit-ish scales (revenue in billions, energy in TWh,
    /// employees in thousands) so plain gradient descent stays stable.
    pub fn synthetic(prefix: &str, companies: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let records = (0..companies)
            .map(|i| {
                let revenue: f64 = rng.gen_range(0.5..5.0);
                let energy: f64 = rng.gen_range(0.1..2.0);
                let employees: f64 = rng.gen_range(0.1..10.0);
                let renewable: f64 = rng.gen_range(0.0..1.0);

                let scope1 = 40.0 * energy * (1.0 - renewable) + rng.gen_range(0.0..5.0);
                let scope2 = 20.0 * energy + rng.gen_range(0.0..2.0);
                let scope3 = 10.0 * revenue + 0.5 * employees;

                EmissionRecord::new(format!("{}-{:03}", prefix, i), scope1, scope2, scope3)
                    .with_feature("revenue", revenue)
                    .with_feature("energy_consumption", energy)
                    .with_feature("employees", employees)
                    .with_feature("renewable_share", renewable)
            })
            .collect();

        Self { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_selection() {
        let record = EmissionRecord::new("acme", 100.0, 50.0, 25.0);
        assert_eq!(record.emissions(EmissionScope::Scope2), 50.0);
        assert_eq!(record.emissions(EmissionScope::Total), 175.0);
    }

    #[test]
    fn test_feature_vector_fills_missing() {
        let record = EmissionRecord::new("acme", 1.0, 1.0, 1.0).with_feature("revenue", 2.5);
        let names = vec!["employees".to_string(), "revenue".to_string()];
        assert_eq!(record.feature_vector(&names), vec![0.0, 2.5]);
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("TOTAL".parse::<EmissionScope>(), Ok(EmissionScope::Total));
        assert_eq!("scope_3".parse::<EmissionScope>(), Ok(EmissionScope::Scope3));
        assert!("scope4".parse::<EmissionScope>().is_err());
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = ClientDataset::synthetic("bank", 5, 11);
        let b = ClientDataset::synthetic("bank", 5, 11);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert!(a.records().iter().all(|r| r.total_emissions() > 0.0));
    }
}
