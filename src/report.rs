use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::Member;
use crate::traversal::RiskTiers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

pub fn build_risk_notification(
    member: &Member,
    criteria: &str,
    lookback_days: u32,
    tiers: &RiskTiers,
) -> RenderedEmail {
    let name = member.display_name();
    let mut output = String::new();

    let _ = writeln!(output, "# COVID-19 Risk Notification");
    let _ = writeln!(output, "Member: {} ({})", name, member.email);
    let _ = writeln!(output, "School: {}", member.school);
    let _ = writeln!(
        output,
        "Cohort: {}",
        member.cohort.as_deref().unwrap_or("N/A")
    );
    let _ = writeln!(output, "Criteria: {}", criteria);
    let _ = writeln!(output, "Interactions considered: last {} days", lookback_days);

    for tier in &tiers.tiers {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {} ({})", tier.tier.label, tier.tier.name);

        if tier.contacts.is_empty() {
            let _ = writeln!(output, "No contacts in this tier.");
        } else {
            for contact in &tier.contacts {
                let _ = writeln!(output, "- {}", contact.name);
            }
        }
    }

    RenderedEmail {
        subject: format!("[{}] Risk notification for {}", member.school, name),
        body: output,
    }
}

pub fn build_daily_digest(school: &str, day: NaiveDate, missing: &[Member]) -> RenderedEmail {
    let mut output = String::new();

    let _ = writeln!(output, "# Daily Report Digest");
    let _ = writeln!(output, "Generated for {} on {}", school, day);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Members Without a Report ({})", missing.len());

    if missing.is_empty() {
        let _ = writeln!(output, "Everyone has reported today.");
    } else {
        for member in missing {
            let _ = writeln!(
                output,
                "- {} ({}, cohort {})",
                member.display_name(),
                member.email,
                member.cohort.as_deref().unwrap_or("N/A")
            );
        }
    }

    RenderedEmail {
        subject: format!("[{}] Daily digest for {}", school, day),
        body: output,
    }
}

/// Sent to a member whose reports now go to another campus.
pub fn build_campus_switch(campus: &str) -> RenderedEmail {
    let mut output = String::new();

    let _ = writeln!(output, "# Campus Change");
    let _ = writeln!(output, "Your account has been moved to {}.", campus);
    let _ = writeln!(
        output,
        "Daily health reports now go to {} starting with your next submission.",
        campus
    );

    RenderedEmail {
        subject: format!("[{}] Your campus has changed", campus),
        body: output,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::{LocationStatus, MemberStatus, Role, VaccinationStatus};
    use crate::traversal::{RiskContact, TierContacts, TierPlan};

    fn member(email: &str, first: &str, last: &str, cohort: Option<&str>) -> Member {
        Member {
            id: Uuid::new_v4(),
            email: email.to_string(),
            school: "ridge".to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            cohort: cohort.map(str::to_string),
            role: Role::Student,
            location: LocationStatus::Campus,
            vaccination: VaccinationStatus::NotVaccinated,
            status: MemberStatus::Active,
            disabled: false,
        }
    }

    #[test]
    fn notification_lists_every_tier_even_when_empty() {
        let plan = TierPlan::default();
        let tiers = RiskTiers {
            tiers: vec![
                TierContacts {
                    tier: plan.tiers()[0].clone(),
                    contacts: vec![RiskContact {
                        email: "b@ridge.edu".to_string(),
                        name: "Ben Bell".to_string(),
                    }],
                },
                TierContacts {
                    tier: plan.tiers()[1].clone(),
                    contacts: vec![],
                },
            ],
        };

        let email = build_risk_notification(
            &member("a@ridge.edu", "Ana", "Alvarez", None),
            "Positive Test",
            14,
            &tiers,
        );

        assert_eq!(email.subject, "[ridge] Risk notification for Ana Alvarez");
        assert!(email.body.contains("Cohort: N/A"));
        assert!(email.body.contains("Criteria: Positive Test"));
        assert!(email.body.contains("- Ben Bell"));
        assert!(email
            .body
            .contains("## Second-degree contact (medium_risk)\nNo contacts in this tier."));
    }

    #[test]
    fn digest_lists_missing_members() {
        let day = NaiveDate::from_ymd_opt(2021, 4, 1).unwrap();
        let email = build_daily_digest(
            "ridge",
            day,
            &[member("c@ridge.edu", "Cam", "Cole", Some("7A"))],
        );
        assert!(email.body.contains("## Members Without a Report (1)"));
        assert!(email.body.contains("- Cam Cole (c@ridge.edu, cohort 7A)"));

        let empty = build_daily_digest("ridge", day, &[]);
        assert!(empty.body.contains("Everyone has reported today."));
    }

    #[test]
    fn campus_switch_names_the_new_campus() {
        let email = build_campus_switch("valley");
        assert_eq!(email.subject, "[valley] Your campus has changed");
        assert!(email.body.contains("moved to valley."));
    }
}
