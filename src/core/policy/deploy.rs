use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::bandit::{write_text_atomic, ArmStats, ThompsonBandit};
use super::catalog::PolicyCatalog;
use crate::core::feedback::StoreError;

/// Persisted deploy state format version.
const STATE_VERSION: u32 = 1;

/// Deploy gate configuration.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub traffic_split_new: f64,
    pub traffic_split_uncertain: f64,
    /// Cap on simultaneously active variants, excluding the base.
    pub max_active_variants: usize,
    /// Pulls below which a variant counts as new.
    pub min_pulls_for_confidence: u64,
    /// Posterior mean below which an evidenced variant stays uncertain.
    pub uncertainty_threshold: f64,
    pub blacklist_min_samples: u64,
    pub blacklist_min_reward: f64,
    pub bandit_state_path: Option<PathBuf>,
    pub deploy_state_path: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            traffic_split_new: 0.10,
            traffic_split_uncertain: 0.05,
            max_active_variants: 5,
            min_pulls_for_confidence: 10,
            uncertainty_threshold: 0.6,
            blacklist_min_samples: 20,
            blacklist_min_reward: -0.2,
            bandit_state_path: None,
            deploy_state_path: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DeployStateFile {
    version: u32,
    active: Vec<String>,
    blacklist: Vec<String>,
    new_variants: Vec<String>,
    uncertain_variants: Vec<String>,
    base_variant_id: String,
}

/// Snapshot of the deployment for status endpoints.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeploymentStatus {
    pub base_variant_id: String,
    pub active: Vec<String>,
    pub blacklist: Vec<String>,
    pub new_variants: Vec<String>,
    pub uncertain_variants: Vec<String>,
}

/// Health view of a single variant.
#[derive(Debug, Clone, Serialize)]
pub struct VariantHealth {
    pub id: String,
    pub is_active: bool,
    pub is_blacklisted: bool,
    pub is_new: bool,
    pub is_uncertain: bool,
    pub stats: Option<ArmStats>,
}

struct DeployInner {
    bandit: ThompsonBandit,
    active: BTreeSet<String>,
    blacklist: BTreeSet<String>,
    new_variants: BTreeSet<String>,
    uncertain_variants: BTreeSet<String>,
    rng: StdRng,
}

/// Traffic-split and blacklist wrapper over the bandit.
///
/// New and uncertain variants get a bounded exploration share before the
/// bandit decides among everything else; variants that prove harmful are
/// moved to the blacklist after each feedback update. The base variant is
/// always active and immune to blacklisting.
///
/// All state lives behind one mutex whose critical sections stay
/// O(|variants|); disk writes happen outside it.
pub struct DeployGate {
    inner: Mutex<DeployInner>,
    config: DeployConfig,
    base_variant_id: String,
}

impl DeployGate {
    /// Build the gate from the catalog and persisted state.
    ///
    /// Catalog ids missing from the bandit state are seeded with fresh
    /// priors and enter rotation through the new-variant split. The RNG is
    /// injected so selection is reproducible in tests.
    pub fn new(catalog: &PolicyCatalog, config: DeployConfig, rng: StdRng) -> Self {
        let mut bandit = ThompsonBandit::new(
            config.min_pulls_for_confidence,
            config.blacklist_min_samples,
            config.blacklist_min_reward,
            config.bandit_state_path.clone(),
        );

        let loaded = config
            .deploy_state_path
            .as_deref()
            .and_then(load_deploy_state);

        let mut active: BTreeSet<String> = BTreeSet::new();
        let mut blacklist: BTreeSet<String> = BTreeSet::new();
        let mut new_variants: BTreeSet<String> = BTreeSet::new();
        let mut uncertain_variants: BTreeSet<String> = BTreeSet::new();

        if let Some(state) = loaded {
            active.extend(state.active);
            blacklist.extend(state.blacklist);
            new_variants.extend(state.new_variants);
            uncertain_variants.extend(state.uncertain_variants);
        }

        for id in catalog.ids() {
            let seeded = bandit.ensure_arm(&id);
            let known = active.contains(&id) || blacklist.contains(&id);
            if seeded && !known {
                // Fresh id from the catalog: active, explored via the new split
                active.insert(id.clone());
                new_variants.insert(id.clone());
                info!(variant = %id, "new policy variant enrolled");
            }
        }

        let base = catalog.base_id().to_string();
        // Base variant invariants hold regardless of what the file said
        blacklist.remove(&base);
        active.insert(base.clone());
        new_variants.remove(&base);
        uncertain_variants.remove(&base);
        // A variant cannot sit on both sides
        for id in blacklist.iter() {
            active.remove(id);
        }

        crate::metrics::set_variant_counts(active.len(), blacklist.len());

        Self {
            inner: Mutex::new(DeployInner {
                bandit,
                active,
                blacklist,
                new_variants,
                uncertain_variants,
                rng,
            }),
            config,
            base_variant_id: base,
        }
    }

    pub fn base_variant_id(&self) -> &str {
        &self.base_variant_id
    }

    /// Select the variant for a new call.
    ///
    /// Order: new-variant split, then uncertain-variant split, then the
    /// bandit over the remaining eligible set, then the base variant when
    /// nothing else is eligible. Deterministic for a fixed RNG seed and
    /// fixed state.
    pub fn select_variant(&self) -> String {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let selected = select_inner(inner, &self.config, &self.base_variant_id);
        crate::metrics::record_policy_pull(&selected);
        selected
    }

    /// Fold a call's reward into the bandit and refresh deployment state.
    ///
    /// Returns a persistence error after the in-memory update succeeded;
    /// the caller parks the reward in the outbox and retries persistence,
    /// it must not re-apply the reward.
    pub async fn record_feedback(&self, variant_id: &str, reward: f64) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;

            inner.bandit.update(variant_id, reward);
            reclassify(inner, &self.config, &self.base_variant_id, variant_id);

            for candidate in inner.bandit.blacklist_candidates() {
                if candidate == self.base_variant_id {
                    continue;
                }
                if inner.active.remove(&candidate) {
                    inner.blacklist.insert(candidate.clone());
                    inner.new_variants.remove(&candidate);
                    inner.uncertain_variants.remove(&candidate);
                    crate::metrics::record_variant_blacklisted(&candidate);
                    warn!(variant = %candidate, "variant blacklisted on poor reward");
                }
            }
            crate::metrics::set_variant_counts(inner.active.len(), inner.blacklist.len());
        }

        self.persist_now().await
    }

    /// Persist both state files off the async threads.
    ///
    /// Safe to call repeatedly; used by the outbox retry loop and the
    /// shutdown flush.
    pub async fn persist_now(&self) -> Result<(), StoreError> {
        let (bandit_snapshot, deploy_snapshot) = {
            let inner = self.inner.lock();
            let bandit_snapshot = inner.bandit.snapshot_for_persist()?;
            let deploy_snapshot = match &self.config.deploy_state_path {
                Some(path) => Some((
                    path.clone(),
                    serde_json::to_string(&DeployStateFile {
                        version: STATE_VERSION,
                        active: inner.active.iter().cloned().collect(),
                        blacklist: inner.blacklist.iter().cloned().collect(),
                        new_variants: inner.new_variants.iter().cloned().collect(),
                        uncertain_variants: inner.uncertain_variants.iter().cloned().collect(),
                        base_variant_id: self.base_variant_id.clone(),
                    })?,
                )),
                None => None,
            };
            (bandit_snapshot, deploy_snapshot)
        };

        tokio::task::spawn_blocking(move || {
            if let Some((path, contents)) = bandit_snapshot {
                write_text_atomic(&path, &contents)?;
            }
            if let Some((path, contents)) = deploy_snapshot {
                write_text_atomic(&path, &contents)?;
            }
            Ok(())
        })
        .await
        .map_err(|_| StoreError::TaskCancelled)?
    }

    /// Add a variant to the active rotation.
    pub fn add_variant(&self, variant_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.blacklist.contains(variant_id) {
            warn!(variant = %variant_id, "refusing to activate blacklisted variant");
            return false;
        }
        let non_base_active = inner
            .active
            .iter()
            .filter(|id| **id != self.base_variant_id)
            .count();
        if !inner.active.contains(variant_id) && non_base_active >= self.config.max_active_variants
        {
            warn!(
                variant = %variant_id,
                cap = self.config.max_active_variants,
                "active variant cap reached"
            );
            return false;
        }
        inner.bandit.ensure_arm(variant_id);
        inner.active.insert(variant_id.to_string());
        if inner.bandit.is_uncertain(variant_id) {
            inner.new_variants.insert(variant_id.to_string());
        }
        crate::metrics::set_variant_counts(inner.active.len(), inner.blacklist.len());
        true
    }

    /// Remove a variant from rotation. The base variant refuses.
    pub fn remove_variant(&self, variant_id: &str) -> bool {
        if variant_id == self.base_variant_id {
            warn!("base variant cannot be removed from deployment");
            return false;
        }
        let mut inner = self.inner.lock();
        let removed = inner.active.remove(variant_id);
        inner.new_variants.remove(variant_id);
        inner.uncertain_variants.remove(variant_id);
        crate::metrics::set_variant_counts(inner.active.len(), inner.blacklist.len());
        removed
    }

    pub fn status(&self) -> DeploymentStatus {
        let inner = self.inner.lock();
        DeploymentStatus {
            base_variant_id: self.base_variant_id.clone(),
            active: inner.active.iter().cloned().collect(),
            blacklist: inner.blacklist.iter().cloned().collect(),
            new_variants: inner.new_variants.iter().cloned().collect(),
            uncertain_variants: inner.uncertain_variants.iter().cloned().collect(),
        }
    }

    pub fn variant_health(&self, variant_id: &str) -> VariantHealth {
        let inner = self.inner.lock();
        VariantHealth {
            id: variant_id.to_string(),
            is_active: inner.active.contains(variant_id),
            is_blacklisted: inner.blacklist.contains(variant_id),
            is_new: inner.new_variants.contains(variant_id),
            is_uncertain: inner.uncertain_variants.contains(variant_id),
            stats: inner
                .bandit
                .stats()
                .into_iter()
                .find(|s| s.variant_id == variant_id),
        }
    }

    /// Bandit stats for all arms, for the status surface.
    pub fn arm_stats(&self) -> Vec<ArmStats> {
        self.inner.lock().bandit.stats()
    }
}

fn select_inner(inner: &mut DeployInner, config: &DeployConfig, base: &str) -> String {
    let active_new: Vec<&String> = inner
        .active
        .iter()
        .filter(|id| inner.new_variants.contains(*id))
        .collect();
    if !active_new.is_empty() && inner.rng.gen_bool(config.traffic_split_new) {
        let pick = active_new[inner.rng.gen_range(0..active_new.len())].clone();
        return pick;
    }

    let active_uncertain: Vec<&String> = inner
        .active
        .iter()
        .filter(|id| {
            inner.uncertain_variants.contains(*id) && !inner.new_variants.contains(*id)
        })
        .collect();
    if !active_uncertain.is_empty() && inner.rng.gen_bool(config.traffic_split_uncertain) {
        let pick = active_uncertain[inner.rng.gen_range(0..active_uncertain.len())].clone();
        return pick;
    }

    // Exploration traffic for new/uncertain variants is capped by their
    // splits above, so the bandit competes only the proven arms. When no
    // proven arm exists yet, everything active is eligible.
    let proven: Vec<String> = inner
        .active
        .iter()
        .filter(|id| {
            !inner.blacklist.contains(*id)
                && !inner.new_variants.contains(*id)
                && !inner.uncertain_variants.contains(*id)
        })
        .cloned()
        .collect();
    let eligible = if proven.is_empty() {
        inner
            .active
            .iter()
            .filter(|id| !inner.blacklist.contains(*id))
            .cloned()
            .collect()
    } else {
        proven
    };
    inner
        .bandit
        .sample(&eligible, &mut inner.rng)
        .unwrap_or_else(|| base.to_string())
}

fn reclassify(inner: &mut DeployInner, config: &DeployConfig, base: &str, variant_id: &str) {
    if variant_id == base {
        inner.new_variants.remove(variant_id);
        inner.uncertain_variants.remove(variant_id);
        return;
    }
    let Some(arm) = inner.bandit.arm(variant_id) else {
        return;
    };
    if arm.pulls < config.min_pulls_for_confidence {
        inner.new_variants.insert(variant_id.to_string());
        inner.uncertain_variants.remove(variant_id);
    } else {
        inner.new_variants.remove(variant_id);
        if arm.posterior_mean() < config.uncertainty_threshold {
            inner.uncertain_variants.insert(variant_id.to_string());
        } else {
            inner.uncertain_variants.remove(variant_id);
        }
    }
}

fn load_deploy_state(path: &Path) -> Option<DeployStateFile> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "deploy state unreadable: {e}");
            return None;
        }
    };
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), "deploy state corrupt, starting fresh: {e}");
            None
        }
    }
}
