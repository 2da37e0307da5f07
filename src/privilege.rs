//! Scoped privilege escalation.
//!
//! Catalog writes run as the owner of the catalog tables. [`Elevated`] swaps
//! the transaction's effective identity for the owner and restores the prior
//! identity when it goes out of scope, whether the scope exits normally, by
//! `?` or by unwinding.

use std::ops::{Deref, DerefMut};

use crate::errors::Result;
use crate::models::Identity;
use crate::storage::MetadataTx;

pub struct Elevated<'g, 's> {
    tx: &'g mut (dyn MetadataTx + 's),
    saved: Option<Identity>,
}

impl<'g, 's> Elevated<'g, 's> {
    /// Switch `tx` to `owner` until the guard is dropped.
    pub fn enter(tx: &'g mut (dyn MetadataTx + 's), owner: Identity) -> Self {
        tracing::trace!("Elevating {} to {}", tx.identity().name, owner.name);
        let saved = tx.set_identity(owner);
        Self {
            tx,
            saved: Some(saved),
        }
    }

    /// The identity that will be restored.
    pub fn caller(&self) -> Option<&Identity> {
        self.saved.as_ref()
    }
}

/// Elevate `tx` to the owner recorded in the catalog.
pub fn as_owner<'g, 's>(tx: &'g mut (dyn MetadataTx + 's)) -> Result<Elevated<'g, 's>> {
    let owner = tx.extension_owner()?;
    Ok(Elevated::enter(tx, owner))
}

impl<'s> Deref for Elevated<'_, 's> {
    type Target = dyn MetadataTx + 's;

    fn deref(&self) -> &Self::Target {
        &*self.tx
    }
}

impl DerefMut for Elevated<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.tx
    }
}

impl Drop for Elevated<'_, '_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.tx.set_identity(saved);
        }
    }
}
