use crate::Dim;
use serde::{Deserialize, Serialize};
use vt_core::{SymFloat, SymInt, SymbolId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub id: SymbolId,
    pub int_hint: Option<i64>,
    pub float_hint: Option<f64>,
    /// Name of the source the symbol was created for, if any.
    pub source: Option<String>,
}

/// Shared environment of symbolic sizes and scalars for one pass.
#[derive(Debug, Clone, Default)]
pub struct SymbolEnv {
    records: Vec<SymbolRecord>,
}

impl SymbolEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(
        &mut self,
        int_hint: Option<i64>,
        float_hint: Option<f64>,
        source: Option<&str>,
    ) -> SymbolId {
        let id = SymbolId(u32::try_from(self.records.len()).unwrap_or(u32::MAX));
        self.records.push(SymbolRecord {
            id,
            int_hint,
            float_hint,
            source: source.map(str::to_owned),
        });
        id
    }

    /// Tensor dimension. Sizes 0 and 1 stay static.
    pub fn create_dim(&mut self, size: i64, source: Option<&str>) -> Dim {
        if size == 0 || size == 1 {
            return Dim::Static(size);
        }
        Dim::Symbolic(self.create_symint(size, source))
    }

    pub fn create_symint(&mut self, hint: i64, source: Option<&str>) -> SymInt {
        SymInt {
            symbol: self.allocate(Some(hint), None, source),
            hint: Some(hint),
        }
    }

    pub fn create_symfloat(&mut self, hint: f64, source: Option<&str>) -> SymFloat {
        SymFloat {
            symbol: self.allocate(None, Some(hint), source),
            hint: Some(hint),
        }
    }

    /// Integer whose value is only known at run time.
    pub fn create_unbacked_symint(&mut self) -> SymInt {
        SymInt {
            symbol: self.allocate(None, None, None),
            hint: None,
        }
    }

    pub fn create_unbacked_symfloat(&mut self) -> SymFloat {
        SymFloat {
            symbol: self.allocate(None, None, None),
            hint: None,
        }
    }

    #[must_use]
    pub fn record(&self, id: SymbolId) -> Option<&SymbolRecord> {
        self.records.get(id.0 as usize)
    }

    #[must_use]
    pub fn records(&self) -> &[SymbolRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
