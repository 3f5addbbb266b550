use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::feedback::StoreError;

/// Persisted bandit state format version.
const STATE_VERSION: u32 = 1;

/// Uninformative prior for a fresh arm.
const PRIOR_ALPHA: f64 = 1.0;
const PRIOR_BETA: f64 = 1.0;

/// One arm of the bandit: a Beta posterior over the variant's reward mapped
/// from [-1, +1] into [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditArm {
    pub variant_id: String,
    pub alpha: f64,
    pub beta: f64,
    pub pulls: u64,
    pub last_reward: f64,
}

impl BanditArm {
    fn fresh(variant_id: &str) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            alpha: PRIOR_ALPHA,
            beta: PRIOR_BETA,
            pulls: 0,
            last_reward: 0.0,
        }
    }

    /// Empirical mean reward in [-1, +1], derived from the posterior.
    ///
    /// With fractional updates, `alpha - 1` is the accumulated normalized
    /// reward mass, so the mean normalized reward is `(alpha - 1) / pulls`.
    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            return 0.0;
        }
        2.0 * ((self.alpha - PRIOR_ALPHA) / self.pulls as f64) - 1.0
    }

    /// Posterior mean of the normalized reward.
    pub fn posterior_mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Posterior variance of the normalized reward.
    pub fn posterior_variance(&self) -> f64 {
        let s = self.alpha + self.beta;
        (self.alpha * self.beta) / (s * s * (s + 1.0))
    }
}

/// Per-arm statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ArmStats {
    pub variant_id: String,
    pub pulls: u64,
    pub mean_reward: f64,
    pub posterior_mean: f64,
    pub alpha: f64,
    pub beta: f64,
    pub last_reward: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BanditStateFile {
    version: u32,
    arms: Vec<BanditArm>,
}

/// Thompson-sampling selector over policy variants.
///
/// # Update rule
///
/// Updates are the deterministic fractional variant: a reward `r` in
/// [-1, +1] maps to `p = (r + 1) / 2`, then `alpha += p` and
/// `beta += 1 - p`. Each update adds exactly 1 to `alpha + beta`, so
/// `pulls == (alpha - 1) + (beta - 1)` holds at all times and selection is
/// reproducible under a seeded RNG. (The Bernoulli-draw variant would trade
/// that determinism for nothing this crate needs.)
pub struct ThompsonBandit {
    arms: BTreeMap<String, BanditArm>,
    min_pulls_for_confidence: u64,
    blacklist_min_samples: u64,
    blacklist_min_reward: f64,
    state_path: Option<PathBuf>,
}

impl ThompsonBandit {
    pub fn new(
        min_pulls_for_confidence: u64,
        blacklist_min_samples: u64,
        blacklist_min_reward: f64,
        state_path: Option<PathBuf>,
    ) -> Self {
        let mut bandit = Self {
            arms: BTreeMap::new(),
            min_pulls_for_confidence,
            blacklist_min_samples,
            blacklist_min_reward,
            state_path,
        };
        bandit.load_state();
        bandit
    }

    /// Ensure an arm exists for `variant_id`, initializing a fresh prior.
    ///
    /// Returns true when the arm was newly created.
    pub fn ensure_arm(&mut self, variant_id: &str) -> bool {
        if self.arms.contains_key(variant_id) {
            return false;
        }
        self.arms
            .insert(variant_id.to_string(), BanditArm::fresh(variant_id));
        true
    }

    pub fn arm(&self, variant_id: &str) -> Option<&BanditArm> {
        self.arms.get(variant_id)
    }

    /// Sample each eligible arm's posterior and pick the argmax.
    ///
    /// Ties break toward the arm with more pulls, then the lexicographically
    /// smaller id. Returns `None` when no eligible arm exists.
    pub fn sample<R: Rng>(&self, eligible: &[String], rng: &mut R) -> Option<String> {
        let mut best: Option<(f64, u64, &str)> = None;
        for id in eligible {
            let Some(arm) = self.arms.get(id) else {
                continue;
            };
            let dist = match Beta::new(arm.alpha, arm.beta) {
                Ok(d) => d,
                Err(e) => {
                    warn!(variant = %id, "invalid posterior parameters: {e}");
                    continue;
                }
            };
            let draw = dist.sample(rng);
            let candidate = (draw, arm.pulls, id.as_str());
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let (cur_draw, cur_pulls, cur_id) = current;
                    let better = draw > cur_draw
                        || (draw == cur_draw
                            && (arm.pulls > cur_pulls
                                || (arm.pulls == cur_pulls && id.as_str() < cur_id)));
                    if better { Some(candidate) } else { Some(current) }
                }
            };
        }
        best.map(|(_, _, id)| id.to_string())
    }

    /// Fold one reward into the variant's posterior.
    ///
    /// Unknown variants are ignored with a warning, matching the catalog
    /// being the source of truth for what exists.
    pub fn update(&mut self, variant_id: &str, reward: f64) {
        let Some(arm) = self.arms.get_mut(variant_id) else {
            warn!(variant = %variant_id, "reward for unknown variant dropped");
            return;
        };
        let reward = reward.clamp(-1.0, 1.0);
        let p = (reward + 1.0) / 2.0;
        arm.alpha += p;
        arm.beta += 1.0 - p;
        arm.pulls += 1;
        arm.last_reward = reward;
    }

    /// Whether the variant still lacks the evidence floor.
    pub fn is_uncertain(&self, variant_id: &str) -> bool {
        self.arms
            .get(variant_id)
            .map(|arm| arm.pulls < self.min_pulls_for_confidence)
            .unwrap_or(true)
    }

    /// Variants that earned a blacklisting: enough samples, mean reward at
    /// or below the threshold. The caller filters out the base variant.
    pub fn blacklist_candidates(&self) -> Vec<String> {
        self.arms
            .values()
            .filter(|arm| {
                arm.pulls >= self.blacklist_min_samples
                    && arm.mean_reward() <= self.blacklist_min_reward
            })
            .map(|arm| arm.variant_id.clone())
            .collect()
    }

    /// Mean posterior variance across arms; a rough exploration gauge.
    pub fn exploration_rate(&self) -> f64 {
        if self.arms.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.arms.values().map(|a| a.posterior_variance()).sum();
        sum / self.arms.len() as f64
    }

    pub fn stats(&self) -> Vec<ArmStats> {
        self.arms
            .values()
            .map(|arm| ArmStats {
                variant_id: arm.variant_id.clone(),
                pulls: arm.pulls,
                mean_reward: arm.mean_reward(),
                posterior_mean: arm.posterior_mean(),
                alpha: arm.alpha,
                beta: arm.beta,
                last_reward: arm.last_reward,
            })
            .collect()
    }

    pub fn min_pulls_for_confidence(&self) -> u64 {
        self.min_pulls_for_confidence
    }

    /// Write the current state with the temp-file-and-rename discipline.
    ///
    /// Runs synchronously; callers keep it off the call hot path.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let state = BanditStateFile {
            version: STATE_VERSION,
            arms: self.arms.values().cloned().collect(),
        };
        write_state_atomic(path, &state)
    }

    /// Serialized state plus target path, for persistence on a blocking
    /// thread while the lock is already released.
    pub(crate) fn snapshot_for_persist(&self) -> Result<Option<(PathBuf, String)>, StoreError> {
        let Some(path) = &self.state_path else {
            return Ok(None);
        };
        let state = BanditStateFile {
            version: STATE_VERSION,
            arms: self.arms.values().cloned().collect(),
        };
        Ok(Some((path.clone(), serde_json::to_string(&state)?)))
    }

    fn load_state(&mut self) {
        let Some(path) = self.state_path.clone() else {
            return;
        };
        match read_state(&path) {
            Ok(Some(state)) => {
                info!(arms = state.arms.len(), path = %path.display(), "bandit state loaded");
                for arm in state.arms {
                    if arm.alpha >= PRIOR_ALPHA && arm.beta >= PRIOR_BETA {
                        self.arms.insert(arm.variant_id.clone(), arm);
                    } else {
                        warn!(variant = %arm.variant_id, "discarding arm with invalid posterior");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Corrupt state resets to fresh priors rather than refusing to boot
                warn!(path = %path.display(), "bandit state unreadable, starting fresh: {e}");
            }
        }
    }
}

fn write_state_atomic<T: Serialize>(path: &Path, state: &T) -> Result<(), StoreError> {
    let contents = serde_json::to_string(state)?;
    write_text_atomic(path, &contents)
}

/// Write `contents` with the temp-file, fsync, rename discipline.
pub(crate) fn write_text_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_state(path: &Path) -> Result<Option<BanditStateFile>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&raw)?))
}
