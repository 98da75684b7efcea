use serde::{Deserialize, Serialize};

use larder_core::{AggregateId, IngredientId, SiteId, TenantId};

/// Stream identifier of a stock ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockLedgerId(pub AggregateId);

impl StockLedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for StockLedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Address of a stock ledger: one ingredient at one site of one tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub tenant_id: TenantId,
    pub site_id: SiteId,
    pub ingredient_id: IngredientId,
}

impl LedgerKey {
    pub fn new(tenant_id: TenantId, site_id: SiteId, ingredient_id: IngredientId) -> Self {
        Self {
            tenant_id,
            site_id,
            ingredient_id,
        }
    }

    /// Stream id for this key, stable across processes. The tenant is not
    /// mixed in because every stream is already tenant-scoped in the store.
    pub fn ledger_id(&self) -> StockLedgerId {
        StockLedgerId(AggregateId::derived(
            self.site_id.as_uuid(),
            self.ingredient_id.as_uuid().as_bytes(),
        ))
    }
}

impl core::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.site_id, self.ingredient_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_id_depends_on_site_and_ingredient() {
        let tenant = TenantId::new();
        let site = SiteId::new();
        let flour = IngredientId::new();

        let a = LedgerKey::new(tenant, site, flour);
        let b = LedgerKey::new(tenant, site, flour);
        let other_site = LedgerKey::new(tenant, SiteId::new(), flour);

        assert_eq!(a.ledger_id(), b.ledger_id());
        assert_ne!(a.ledger_id(), other_site.ledger_id());
    }
}
