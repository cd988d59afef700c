use crate::types::RealtimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tables of the inventory schema that can be observed through the changefeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    /// Business locations
    Negocios,
    /// Aggregated stock per product
    InventarioGeneral,
    /// Stock per product and location
    InventarioDetallado,
    /// Stock movements (entries, exits, transfers)
    Movimientos,
    /// Per-user exchange rate preferences
    ExchangeRateConfig,
}

impl TableName {
    pub const ALL: [TableName; 5] = [
        Self::Negocios,
        Self::InventarioGeneral,
        Self::InventarioDetallado,
        Self::Movimientos,
        Self::ExchangeRateConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Negocios => "negocios",
            Self::InventarioGeneral => "inventario_general",
            Self::InventarioDetallado => "inventario_detallado",
            Self::Movimientos => "movimientos",
            Self::ExchangeRateConfig => "exchange_rate_config",
        }
    }
}

impl FromStr for TableName {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| RealtimeError::UnknownTable(s.to_string()))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tables() {
        for table in TableName::ALL {
            assert_eq!(table.as_str().parse::<TableName>().unwrap(), table);
        }
    }

    #[test]
    fn test_parse_unknown_table_fails() {
        let err = "productos_fantasma".parse::<TableName>().unwrap_err();
        assert!(matches!(err, RealtimeError::UnknownTable(name) if name == "productos_fantasma"));
    }

    #[test]
    fn test_serde_uses_wire_name() {
        let json = serde_json::to_string(&TableName::InventarioDetallado).unwrap();
        assert_eq!(json, r#""inventario_detallado""#);
    }
}
