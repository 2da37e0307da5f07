// CLI admin commands: init, grant

use crate::daemon::Catalog;
use crate::errors::CronError;
use crate::models::Identity;
use crate::storage::schema::{InstallOptions, EXTENSION_NAME, EXTENSION_VERSION};
use crate::storage::{CatalogTable, MetadataStore, Privilege};

/// cronctl init
pub fn cmd_init(
    catalog: &Catalog,
    owner: &str,
    job_ext: bool,
    run_details: bool,
) -> anyhow::Result<()> {
    catalog.store.install(
        owner,
        InstallOptions {
            job_ext,
            run_details,
        },
    )?;

    println!("Installed {} {}.", EXTENSION_NAME, EXTENSION_VERSION);
    println!("  Owner:       {}", owner);
    println!("  Attributes:  {}", if job_ext { "yes" } else { "no" });
    println!("  Run details: {}", if run_details { "yes" } else { "no" });
    Ok(())
}

/// Only a superuser or the catalog owner may hand out privileges.
fn authorize_grant(catalog: &Catalog, caller: &Identity) -> crate::Result<()> {
    if caller.superuser {
        return Ok(());
    }
    let mut tx = catalog.store.begin(caller)?;
    let owner = tx.extension_owner()?;
    let role = tx.role(&caller.name)?;
    tx.commit()?;

    if role.superuser || owner.name.eq_ignore_ascii_case(&caller.name) {
        Ok(())
    } else {
        Err(CronError::PermissionDenied(format!(
            "must be owner of {} to grant privileges",
            EXTENSION_NAME
        )))
    }
}

/// cronctl grant
pub fn cmd_grant(
    catalog: &Catalog,
    caller: &Identity,
    grantee: &str,
    privilege: &str,
    table: &str,
) -> anyhow::Result<()> {
    let privilege: Privilege = privilege.parse()?;
    let table: CatalogTable = table.parse()?;
    authorize_grant(catalog, caller)?;

    catalog.store.grant(grantee, table, privilege)?;
    println!("Granted {} on {} to {}.", privilege, table.name(), grantee);
    Ok(())
}
