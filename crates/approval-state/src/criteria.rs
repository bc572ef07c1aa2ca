//! Policy criteria: the immutable snapshot of what a policy rule protects against.
//!
//! Materialized upstream from a policy document and read-only here. A rule
//! carries a copy; evaluators only ever borrow it.

use serde::{Deserialize, Serialize};

use crate::model::{PolicyId, ProjectId, ScannerKind, Severity};

/// Which commits an `any_merge_request` rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitScope {
    /// Every merge request requires approval
    Any,
    /// Only merge requests containing unsigned commits
    Unsigned,
}

/// Vulnerability states a scan-finding rule counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnerabilityState {
    /// Newly detected and not yet dismissed
    NewNeedsTriage,
    /// Newly detected and dismissed in the pipeline
    NewDismissed,
    Detected,
    Confirmed,
    Resolved,
    Dismissed,
}

impl VulnerabilityState {
    pub fn is_newly_detected(&self) -> bool {
        matches!(
            self,
            VulnerabilityState::NewNeedsTriage | VulnerabilityState::NewDismissed
        )
    }
}

/// Boolean filters on findings; `None` means "don't care"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityAttributes {
    #[serde(default)]
    pub fix_available: Option<bool>,
    #[serde(default)]
    pub false_positive: Option<bool>,
}

impl VulnerabilityAttributes {
    pub fn matches(&self, fix_available: bool, false_positive: bool) -> bool {
        self.fix_available.map_or(true, |want| want == fix_available)
            && self.false_positive.map_or(true, |want| want == false_positive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeOperator {
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeInterval {
    Day,
    Week,
    Month,
    Year,
}

/// Restricts pre-existing vulnerabilities by how long ago they were detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeWindow {
    pub operator: AgeOperator,
    pub value: u32,
    pub interval: AgeInterval,
}

impl AgeWindow {
    /// Window length in whole days.
    pub fn days(&self) -> i64 {
        let unit = match self.interval {
            AgeInterval::Day => 1,
            AgeInterval::Week => 7,
            AgeInterval::Month => 30,
            AgeInterval::Year => 365,
        };
        i64::from(self.value) * unit
    }

    pub fn matches(&self, age_days: i64) -> bool {
        match self.operator {
            AgeOperator::GreaterThan => age_days > self.days(),
            AgeOperator::LessThan => age_days < self.days(),
        }
    }
}

/// License states a license-finding rule looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseState {
    /// Introduced by the merge request (absent on the target branch)
    NewlyDetected,
    /// Already present on the target branch
    Detected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseCriteria {
    /// `true`: `license_types` is a denylist. `false`: an allowlist.
    pub match_on_inclusion_license: bool,
    pub license_types: Vec<String>,
    pub license_states: Vec<LicenseState>,
}

impl LicenseCriteria {
    pub fn denies(&self, license: &str) -> bool {
        let listed = self
            .license_types
            .iter()
            .any(|l| l.eq_ignore_ascii_case(license));
        if self.match_on_inclusion_license {
            listed
        } else {
            !listed
        }
    }
}

/// Project-level approval settings carried by the policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSettings {
    #[serde(default)]
    pub block_branch_modification: bool,
    #[serde(default)]
    pub prevent_pushing_and_force_pushing: bool,
    #[serde(default)]
    pub prevent_approval_by_author: bool,
    #[serde(default)]
    pub prevent_approval_by_commit_author: bool,
    #[serde(default)]
    pub remove_approvals_with_new_commit: bool,
    #[serde(default)]
    pub require_password_to_approve: bool,
}

/// Read-only snapshot of one policy rule's parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCriteria {
    pub policy_id: PolicyId,
    pub project_id: ProjectId,
    #[serde(default)]
    pub commits: Option<CommitScope>,
    /// Empty means newly detected only
    #[serde(default)]
    pub vulnerability_states: Vec<VulnerabilityState>,
    /// Empty means every severity
    #[serde(default)]
    pub severity_levels: Vec<Severity>,
    /// Empty means every scanner
    #[serde(default)]
    pub scanners: Vec<ScannerKind>,
    #[serde(default)]
    pub vulnerability_attributes: VulnerabilityAttributes,
    #[serde(default)]
    pub vulnerability_age: Option<AgeWindow>,
    #[serde(default)]
    pub vulnerabilities_allowed: u32,
    #[serde(default)]
    pub license: Option<LicenseCriteria>,
    #[serde(default)]
    pub approval_settings: ApprovalSettings,
}

impl PolicyCriteria {
    /// Minimal criteria for a policy on a project; refine with the `with_*` methods.
    pub fn new(policy_id: PolicyId, project_id: ProjectId) -> Self {
        Self {
            policy_id,
            project_id,
            commits: None,
            vulnerability_states: Vec::new(),
            severity_levels: Vec::new(),
            scanners: Vec::new(),
            vulnerability_attributes: VulnerabilityAttributes::default(),
            vulnerability_age: None,
            vulnerabilities_allowed: 0,
            license: None,
            approval_settings: ApprovalSettings::default(),
        }
    }

    pub fn with_commits(mut self, scope: CommitScope) -> Self {
        self.commits = Some(scope);
        self
    }

    pub fn with_states(mut self, states: Vec<VulnerabilityState>) -> Self {
        self.vulnerability_states = states;
        self
    }

    pub fn with_severities(mut self, severities: Vec<Severity>) -> Self {
        self.severity_levels = severities;
        self
    }

    pub fn with_scanners(mut self, scanners: Vec<ScannerKind>) -> Self {
        self.scanners = scanners;
        self
    }

    pub fn with_allowed(mut self, allowed: u32) -> Self {
        self.vulnerabilities_allowed = allowed;
        self
    }

    pub fn with_attributes(mut self, attributes: VulnerabilityAttributes) -> Self {
        self.vulnerability_attributes = attributes;
        self
    }

    pub fn with_age(mut self, age: AgeWindow) -> Self {
        self.vulnerability_age = Some(age);
        self
    }

    pub fn with_license(mut self, license: LicenseCriteria) -> Self {
        self.license = Some(license);
        self
    }

    /// Configured states, defaulting to newly detected when none are set.
    pub fn effective_states(&self) -> Vec<VulnerabilityState> {
        if self.vulnerability_states.is_empty() {
            vec![
                VulnerabilityState::NewNeedsTriage,
                VulnerabilityState::NewDismissed,
            ]
        } else {
            self.vulnerability_states.clone()
        }
    }

    pub fn includes_newly_detected(&self) -> bool {
        self.effective_states().iter().any(|s| s.is_newly_detected())
    }

    /// States that describe vulnerabilities already on the default branch.
    pub fn pre_existing_states(&self) -> Vec<VulnerabilityState> {
        self.effective_states()
            .into_iter()
            .filter(|s| !s.is_newly_detected())
            .collect()
    }

    pub fn newly_detected_states(&self) -> Vec<VulnerabilityState> {
        self.effective_states()
            .into_iter()
            .filter(|s| s.is_newly_detected())
            .collect()
    }

    pub fn matches_severity(&self, severity: Severity) -> bool {
        self.severity_levels.is_empty() || self.severity_levels.contains(&severity)
    }

    pub fn matches_scanner(&self, scanner: ScannerKind) -> bool {
        self.scanners.is_empty() || self.scanners.contains(&scanner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> PolicyCriteria {
        PolicyCriteria::new(PolicyId(1), ProjectId(1))
    }

    #[test]
    fn test_empty_states_mean_newly_detected() {
        let c = criteria();
        assert!(c.includes_newly_detected());
        assert!(c.pre_existing_states().is_empty());
    }

    #[test]
    fn test_pre_existing_only_criteria() {
        let c = criteria().with_states(vec![
            VulnerabilityState::Detected,
            VulnerabilityState::Confirmed,
        ]);
        assert!(!c.includes_newly_detected());
        assert_eq!(c.pre_existing_states().len(), 2);
    }

    #[test]
    fn test_mixed_states_split() {
        let c = criteria().with_states(vec![
            VulnerabilityState::NewNeedsTriage,
            VulnerabilityState::Dismissed,
        ]);
        assert!(c.includes_newly_detected());
        assert_eq!(c.pre_existing_states(), vec![VulnerabilityState::Dismissed]);
        assert_eq!(
            c.newly_detected_states(),
            vec![VulnerabilityState::NewNeedsTriage]
        );
    }

    #[test]
    fn test_age_window() {
        let window = AgeWindow {
            operator: AgeOperator::GreaterThan,
            value: 2,
            interval: AgeInterval::Week,
        };
        assert_eq!(window.days(), 14);
        assert!(window.matches(15));
        assert!(!window.matches(14));
    }

    #[test]
    fn test_attributes_dont_care() {
        let any = VulnerabilityAttributes::default();
        assert!(any.matches(true, false));
        let fixable = VulnerabilityAttributes {
            fix_available: Some(true),
            false_positive: Some(false),
        };
        assert!(fixable.matches(true, false));
        assert!(!fixable.matches(false, false));
        assert!(!fixable.matches(true, true));
    }

    #[test]
    fn test_license_allowlist_and_denylist() {
        let deny = LicenseCriteria {
            match_on_inclusion_license: true,
            license_types: vec!["GPL-3.0".to_string()],
            license_states: vec![LicenseState::NewlyDetected],
        };
        assert!(deny.denies("gpl-3.0"));
        assert!(!deny.denies("MIT"));

        let allow = LicenseCriteria {
            match_on_inclusion_license: false,
            ..deny
        };
        assert!(!allow.denies("GPL-3.0"));
        assert!(allow.denies("MIT"));
    }
}
