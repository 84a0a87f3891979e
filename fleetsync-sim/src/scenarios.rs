//! Simulated resource-controller flows.

use anyhow::{Result, bail};
use fleetsync::memory::MemoryControlPlane;
use fleetsync::{Candidate, Engine, GranteeSet, RemoteObject, ResourceId, WaitSpec};
use tracing::{info, warn};

const ROLE: &str = "fleet-managed-instance-role";
const DOCUMENT: &str = "fleet-patch-runbook";

/// Create an activation while its role propagates, wait until usable, delete it.
pub async fn activation(engine: &Engine<MemoryControlPlane>, propagation_attempts: u32) -> Result<()> {
    let api = engine.api();
    api.create_role(ROLE, propagation_attempts).await;

    let id = engine
        .with_retry(|| api.create_with_role("activation", ROLE, ["Pending", "Pending", "Active"]))
        .await?;
    info!(id = %id, "Activation created");

    let spec = engine.wait_spec(["Pending"], ["Active"])?;
    let converged = engine.wait_for(&id, &spec).await?;
    info!(
        id = %id,
        status = %converged.status,
        polls = converged.polls,
        elapsed = ?converged.elapsed,
        "Activation usable"
    );
    if let Some(object) = &converged.object {
        println!("{}", serde_json::to_string_pretty(object)?);
    }

    api.begin_delete(&id, 2).await?;
    let spec = WaitSpec::deleted(["Deleting"], engine.config().wait.timeout())?
        .poll_interval(engine.config().wait.poll_interval())?;
    engine.wait_for(&id, &spec).await?;
    info!(id = %id, "Activation deleted");
    Ok(())
}

/// Share a document with a growing, shrinking, then empty account set.
pub async fn share(engine: &Engine<MemoryControlPlane>, grantees: u32) -> Result<()> {
    let api = engine.api();
    api.insert_object(RemoteObject::new(DOCUMENT, "document", "Active"))
        .await;

    let steps = [
        ("initial share", accounts(0, grantees)),
        ("rotate accounts", accounts(grantees / 2, grantees)),
        ("unchanged", accounts(grantees / 2, grantees)),
        ("unshare all", GranteeSet::new()),
    ];

    let mut previous = GranteeSet::new();
    for (step, desired) in steps {
        let report = engine
            .reconcile_permissions(DOCUMENT, &previous, &desired)
            .await?;
        info!(
            step,
            added = report.added,
            removed = report.removed,
            batches = report.batches,
            "Share reconciled"
        );
        if api.grantees(DOCUMENT).await != desired {
            bail!("grantees of {} diverged after {}", DOCUMENT, step);
        }
        previous = desired;
    }

    info!(
        add_calls = api.add_calls(),
        remove_calls = api.remove_calls(),
        "Share scenario done"
    );
    Ok(())
}

/// Delete user overrides and restore each category's platform default.
pub async fn default_baseline(engine: &Engine<MemoryControlPlane>) -> Result<()> {
    let api = engine.api();
    let owner = engine.config().defaults.platform_owner.clone();

    for (id, name, category) in [
        ("pb-0001", "AWS-AmazonLinux2DefaultPatchBaseline", "AMAZON_LINUX_2"),
        ("pb-0002", "AWS-UbuntuDefaultPatchBaseline", "UBUNTU"),
        ("pb-0003", "AWS-WindowsPredefinedPatchBaseline-OS", "WINDOWS"),
        ("pb-0004", "AWS-DefaultPatchBaseline", "WINDOWS"),
        ("pb-0005", "AWS-SuseDefaultPatchBaseline", "SUSE"),
        ("pb-0006", "AWS-SUSEDefaultPatchBaseline", "SUSE"),
    ] {
        api.insert_candidate(Candidate::new(id, name, owner.as_str(), category))
            .await;
    }

    let mut warnings = 0;
    for category in ["AMAZON_LINUX_2", "UBUNTU", "WINDOWS", "SUSE", "CENTOS"] {
        let custom = ResourceId::new(format!("pb-custom-{}", category.to_lowercase()));
        engine.register_default(category, &custom).await?;

        // The override is deleted; point the category back at the platform baseline
        let report = engine.restore_default(category).await?;
        match &report.restored {
            Some(id) => info!(category, id = %id, "Default restored"),
            None => {
                for warning in &report.warnings {
                    warn!(category, "{}", warning);
                }
                warnings += report.warnings.len();
            }
        }
    }

    info!(warnings, "Default baseline scenario done");
    Ok(())
}

fn accounts(first: u32, count: u32) -> GranteeSet {
    (first..first + count).map(|n| format!("{:012}", n)).collect()
}
