use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::engine::EngineError;
use crate::model::{parse_license_list, LicenseReq};

/// A hierarchical (user, account, cluster) identity record used for
/// accounting-based access control. Parent pointers form a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssocRecord {
    pub id: u32,
    pub parent: Option<u32>,
    pub account: String,
    /// `None` marks an account-level association.
    pub user: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssocConfig {
    pub id: u32,
    #[serde(default)]
    pub parent: Option<u32>,
    pub account: String,
    #[serde(default)]
    pub user: Option<u32>,
}

#[derive(Default)]
pub struct AssocTable {
    by_id: HashMap<u32, AssocRecord>,
}

impl AssocTable {
    pub fn new(records: Vec<AssocRecord>) -> Self {
        Self {
            by_id: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn get(&self, id: u32) -> Option<&AssocRecord> {
        self.by_id.get(&id)
    }

    pub fn parent_of(&self, id: u32) -> Option<u32> {
        self.by_id.get(&id).and_then(|r| r.parent)
    }

    /// The (user, account) leaf association, if one exists.
    pub fn find(&self, user: u32, account: &str) -> Option<u32> {
        self.by_id
            .values()
            .find(|r| r.user == Some(user) && r.account == account)
            .map(|r| r.id)
    }

    pub fn of_user(&self, user: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .by_id
            .values()
            .filter(|r| r.user == Some(user))
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Account-level associations for an account name.
    pub fn of_account(&self, account: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .by_id
            .values()
            .filter(|r| r.account == account && r.user.is_none())
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn account_known(&self, account: &str) -> bool {
        self.by_id.values().any(|r| r.account == account)
    }
}

/// Read-only snapshot of the data an external accounting component feeds
/// us: the association tree, the set of valid accounts, and the cluster's
/// configured license pool.
pub struct Accounting {
    assocs: AssocTable,
    valid_accounts: HashSet<String>,
    licenses: HashMap<String, u32>,
    enforce_assoc: bool,
}

impl Accounting {
    pub fn new(
        assoc_cfgs: Vec<AssocConfig>,
        licenses: HashMap<String, u32>,
        enforce_assoc: bool,
    ) -> Self {
        let records: Vec<AssocRecord> = assoc_cfgs
            .into_iter()
            .map(|c| AssocRecord {
                id: c.id,
                parent: c.parent,
                account: c.account,
                user: c.user,
            })
            .collect();
        let valid_accounts = records.iter().map(|r| r.account.clone()).collect();
        Self {
            assocs: AssocTable::new(records),
            valid_accounts,
            licenses,
            enforce_assoc,
        }
    }

    /// Empty provider: no associations, no licenses, explicit-list ACLs only.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), HashMap::new(), false)
    }

    pub fn assocs(&self) -> &AssocTable {
        &self.assocs
    }

    pub fn enforce_assoc(&self) -> bool {
        self.enforce_assoc
    }

    pub fn account_valid(&self, account: &str) -> bool {
        // With no accounting data loaded every account name is accepted.
        self.valid_accounts.is_empty() || self.valid_accounts.contains(account)
    }

    pub fn license_total(&self, name: &str) -> Option<u32> {
        self.licenses.get(name).copied()
    }

    /// Parse and validate a license request string against the cluster
    /// license pool.
    pub fn validate_licenses(&self, list: &str) -> Result<Vec<LicenseReq>, EngineError> {
        let reqs =
            parse_license_list(list).map_err(EngineError::InvalidLicenses)?;
        for req in &reqs {
            match self.licenses.get(&req.name) {
                None => {
                    return Err(EngineError::InvalidLicenses(format!(
                        "unknown license {:?}",
                        req.name
                    )));
                }
                Some(&total) if req.count > total => {
                    return Err(EngineError::InvalidLicenses(format!(
                        "license {:?}: requested {} of {}",
                        req.name, req.count, total
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(reqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Accounting {
        let assocs = vec![
            AssocConfig { id: 1, parent: None, account: "root".into(), user: None },
            AssocConfig { id: 10, parent: Some(1), account: "phys".into(), user: None },
            AssocConfig { id: 11, parent: Some(10), account: "phys".into(), user: Some(1000) },
            AssocConfig { id: 12, parent: Some(10), account: "phys".into(), user: Some(1001) },
            AssocConfig { id: 20, parent: Some(1), account: "chem".into(), user: None },
        ];
        let mut lic = HashMap::new();
        lic.insert("matlab".to_string(), 8);
        Accounting::new(assocs, lic, true)
    }

    #[test]
    fn chain_walk() {
        let p = provider();
        assert_eq!(p.assocs().parent_of(11), Some(10));
        assert_eq!(p.assocs().parent_of(10), Some(1));
        assert_eq!(p.assocs().parent_of(1), None);
    }

    #[test]
    fn lookup_by_identity() {
        let p = provider();
        assert_eq!(p.assocs().find(1000, "phys"), Some(11));
        assert_eq!(p.assocs().find(1000, "chem"), None);
        assert_eq!(p.assocs().of_user(1000), vec![11]);
        assert_eq!(p.assocs().of_account("phys"), vec![10]);
    }

    #[test]
    fn account_validity() {
        let p = provider();
        assert!(p.account_valid("phys"));
        assert!(!p.account_valid("nosuch"));
        assert!(Accounting::disabled().account_valid("anything"));
    }

    #[test]
    fn license_validation() {
        let p = provider();
        assert_eq!(
            p.validate_licenses("matlab:4").unwrap(),
            vec![LicenseReq { name: "matlab".into(), count: 4 }]
        );
        assert!(p.validate_licenses("matlab:9").is_err());
        assert!(p.validate_licenses("vtune").is_err());
    }
}
