use crate::descriptor::GuestDescriptor;
use crate::{Result, ShiftError};
use serde::{Deserialize, Serialize};

/// A compute sizing template offered by the destination cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorCandidate {
    pub id: String,
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

/// What the guest needs from a flavor. Disk demand is the sum of all source
/// disk capacities, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlavorRequirements {
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
}

impl FlavorRequirements {
    pub fn from_guest(guest: &GuestDescriptor) -> Self {
        Self {
            vcpus: guest.instance.hw_processor_count,
            ram_mb: guest.instance.hw_memtotal_mb,
            disk_mb: guest.total_disk_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub flavor_id: String,
    pub distance: u64,
}

fn abs_diff(a: u64, b: u64) -> u64 {
    a.max(b) - a.min(b)
}

/// Distance between a candidate and the requirements: the sum of absolute
/// differences across the vcpu, ram and disk dimensions. The quantities are
/// deliberately NOT normalized (vcpu count + MB + MB), so the MB-scale
/// dimensions dominate; changing the weighting would change migration
/// outcomes, so the formula is preserved as-is.
pub fn flavor_distance(candidate: &FlavorCandidate, req: &FlavorRequirements) -> u64 {
    abs_diff(u64::from(candidate.vcpus), u64::from(req.vcpus))
        + abs_diff(candidate.ram_mb, req.ram_mb)
        + abs_diff(candidate.disk_gb * 1024, req.disk_mb)
}

/// Pick the best-fit flavor: minimum distance, ties broken by ascending
/// flavor id so identical inputs always select the same candidate.
pub fn select(req: &FlavorRequirements, candidates: &[FlavorCandidate]) -> Result<MatchResult> {
    let best = candidates
        .iter()
        .min_by(|a, b| {
            flavor_distance(a, req)
                .cmp(&flavor_distance(b, req))
                .then_with(|| a.id.cmp(&b.id))
        })
        .ok_or(ShiftError::NoCandidates)?;

    Ok(MatchResult {
        flavor_id: best.id.clone(),
        distance: flavor_distance(best, req),
    })
}
