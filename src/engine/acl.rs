use tracing::warn;

use crate::assoc::{Accounting, AssocTable};
use crate::limits::MAX_ACL_ENTRIES;
use crate::model::Reservation;

/// Decide whether a job identity may use a reservation.
///
/// With association enforcement active the packed `assoc_list` is walked
/// against the job's association parent chain; an explicit deny anywhere in
/// the chain rejects before the walk continues upward. A reservation whose
/// `assoc_list` was never computed falls back to the explicit lists.
pub fn admits(
    resv: &Reservation,
    user_id: u32,
    account: &str,
    assoc_id: Option<u32>,
    accounting: &Accounting,
) -> bool {
    if !accounting.enforce_assoc() {
        return explicit_admits(resv, user_id, account);
    }
    if resv.assoc_list.is_empty() {
        // Corrupt or never-computed ACL state; explicit lists are the
        // safety net.
        warn!(resv = %resv.name, "empty assoc_list under enforcement, using explicit lists");
        return explicit_admits(resv, user_id, account);
    }
    let start = assoc_id.or_else(|| accounting.assocs().find(user_id, account));
    let Some(start) = start else {
        return false; // no association record at all
    };

    let mut allowed = false;
    let mut cur = Some(start);
    while let Some(id) = cur {
        if assoc_list_has(&resv.assoc_list, id, true) {
            return false; // deny short-circuits
        }
        if assoc_list_has(&resv.assoc_list, id, false) {
            allowed = true;
        }
        cur = accounting.assocs().parent_of(id);
    }
    allowed
}

/// Explicit allow/deny list evaluation. An empty list, or a list marked
/// "not", treats absence-from-list as membership; a job is admitted when it
/// passes the user test and, if an account list is present, the account
/// test too.
pub fn explicit_admits(resv: &Reservation, user_id: u32, account: &str) -> bool {
    let user_listed = resv.users.contains(&user_id);
    let user_ok = if resv.users.is_empty() {
        true
    } else if resv.user_not {
        !user_listed
    } else {
        user_listed
    };
    if !user_ok {
        return false;
    }

    if resv.accounts.is_empty() {
        return true;
    }
    let account_listed = resv.accounts.iter().any(|a| a == account);
    if resv.account_not {
        !account_listed
    } else {
        account_listed
    }
}

fn assoc_list_has(list: &str, id: u32, deny: bool) -> bool {
    list.split(',').any(|tok| {
        let tok = tok.trim();
        match tok.strip_prefix('-') {
            Some(rest) => deny && rest.parse::<u32>() == Ok(id),
            None => !deny && tok.parse::<u32>() == Ok(id),
        }
    })
}

/// Resolve the explicit account/user lists into packed signed association
/// tokens. Both lists restrictive and non-negated: the cross-product of
/// (user, account) leaf associations, all allows. Otherwise each populated
/// dimension is walked on its own, token sign following that dimension's
/// not-flag.
pub fn build_assoc_list(
    accounts: &[String],
    account_not: bool,
    users: &[u32],
    user_not: bool,
    assocs: &AssocTable,
) -> String {
    let mut tokens: Vec<i64> = Vec::new();

    if !accounts.is_empty() && !users.is_empty() && !account_not && !user_not {
        for account in accounts {
            for &user in users {
                if let Some(id) = assocs.find(user, account) {
                    tokens.push(i64::from(id));
                }
            }
        }
    } else {
        if !users.is_empty() {
            for &user in users {
                for id in assocs.of_user(user) {
                    tokens.push(if user_not { -i64::from(id) } else { i64::from(id) });
                }
            }
        }
        if !accounts.is_empty() {
            for account in accounts {
                for id in assocs.of_account(account) {
                    tokens.push(if account_not { -i64::from(id) } else { i64::from(id) });
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    tokens.retain(|t| seen.insert(*t));
    tokens.truncate(MAX_ACL_ENTRIES);
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::AssocConfig;
    use crate::bitmap::Bitmap;
    use crate::model::ResvFlags;
    use std::collections::HashMap;

    fn resv(users: &[u32], user_not: bool, accounts: &[&str], account_not: bool) -> Reservation {
        Reservation {
            resv_id: 1,
            name: "t".into(),
            start_time: 0,
            end_time: 1,
            duration: None,
            start_time_first: 0,
            start_time_prev: 0,
            flags: ResvFlags::empty(),
            partition: None,
            node_bitmap: Bitmap::new(0),
            core_bitmap: None,
            node_list: String::new(),
            node_cnt: 0,
            cpu_cnt: 0,
            accounts: accounts.iter().map(|s| s.to_string()).collect(),
            account_not,
            users: users.to_vec(),
            user_not,
            assoc_list: String::new(),
            licenses: vec![],
            features: None,
            job_pend_cnt: 0,
            job_run_cnt: 0,
        }
    }

    fn provider() -> Accounting {
        Accounting::new(
            vec![
                AssocConfig { id: 1, parent: None, account: "root".into(), user: None },
                AssocConfig { id: 10, parent: Some(1), account: "phys".into(), user: None },
                AssocConfig { id: 11, parent: Some(10), account: "phys".into(), user: Some(1000) },
                AssocConfig { id: 12, parent: Some(10), account: "phys".into(), user: Some(1001) },
            ],
            HashMap::new(),
            true,
        )
    }

    #[test]
    fn explicit_allow_list() {
        let r = resv(&[1000], false, &[], false);
        assert!(explicit_admits(&r, 1000, "any"));
        assert!(!explicit_admits(&r, 1001, "any"));
    }

    #[test]
    fn explicit_deny_duality() {
        // user_not with {42}: everyone except 42.
        let r = resv(&[42], true, &[], false);
        assert!(explicit_admits(&r, 41, "any"));
        assert!(explicit_admits(&r, 43, "any"));
        assert!(!explicit_admits(&r, 42, "any"));
    }

    #[test]
    fn explicit_account_test_combined() {
        let r = resv(&[1000], false, &["phys"], false);
        assert!(explicit_admits(&r, 1000, "phys"));
        assert!(!explicit_admits(&r, 1000, "chem"));

        // Empty user list: account test alone decides.
        let r = resv(&[], false, &["phys"], true);
        assert!(!explicit_admits(&r, 5, "phys"));
        assert!(explicit_admits(&r, 5, "chem"));
    }

    #[test]
    fn assoc_allow_via_parent_chain() {
        let p = provider();
        let mut r = resv(&[], false, &["phys"], false);
        // Account-level allow for phys.
        r.assoc_list = "10".into();
        // Job's leaf assoc is 11, whose parent chain hits 10.
        assert!(admits(&r, 1000, "phys", Some(11), &p));
        // Chain from the root-only assoc never reaches 10.
        assert!(!admits(&r, 0, "root", Some(1), &p));
    }

    #[test]
    fn assoc_deny_short_circuits() {
        let p = provider();
        let mut r = resv(&[], false, &["phys"], false);
        r.assoc_list = "10,-11".into();
        assert!(!admits(&r, 1000, "phys", Some(11), &p)); // denied at leaf
        assert!(admits(&r, 1001, "phys", Some(12), &p)); // sibling still allowed
    }

    #[test]
    fn assoc_empty_list_falls_back_to_explicit() {
        let p = provider();
        let r = resv(&[1000], false, &[], false);
        assert!(admits(&r, 1000, "phys", Some(11), &p));
        assert!(!admits(&r, 1001, "phys", Some(12), &p));
    }

    #[test]
    fn assoc_lookup_when_job_has_no_pointer() {
        let p = provider();
        let mut r = resv(&[], false, &["phys"], false);
        r.assoc_list = "11".into();
        assert!(admits(&r, 1000, "phys", None, &p));
        assert!(!admits(&r, 2000, "nosuch", None, &p));
    }

    #[test]
    fn build_cross_product() {
        let p = provider();
        let list = build_assoc_list(
            &["phys".into()],
            false,
            &[1000, 1001],
            false,
            p.assocs(),
        );
        assert_eq!(list, "11,12");
    }

    #[test]
    fn build_single_dimension_signs() {
        let p = provider();
        let users_only = build_assoc_list(&[], false, &[1000], true, p.assocs());
        assert_eq!(users_only, "-11");
        let accounts_only = build_assoc_list(&["phys".into()], false, &[], false, p.assocs());
        assert_eq!(accounts_only, "10");
    }

    #[test]
    fn build_mixed_negation_walks_both_dimensions() {
        let p = provider();
        let list = build_assoc_list(&["phys".into()], false, &[1001], true, p.assocs());
        assert_eq!(list, "-12,10");
    }
}
