//! Role to action table and the authorization decision.

use crate::types::{Action, Decision, Principal, RoleBinding};

pub const PROJECT_ROLE_ID: &str = "orchestrate.project";
pub const ARTIFACT_VIEWER_ROLE: &str = "roles/storage.objectViewer";

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    project_role: String,
}

impl AccessPolicy {
    pub fn new(orchestrate_project: &str) -> Self {
        Self {
            project_role: format!("projects/{}/roles/{}", orchestrate_project, PROJECT_ROLE_ID),
        }
    }

    /// Custom role granting workflow access, defined in the orchestrate project.
    pub fn project_role(&self) -> &str {
        &self.project_role
    }

    /// Roles bound to a tenant's service account on registration.
    pub fn tenant_roles(&self) -> Vec<String> {
        vec![self.project_role.clone(), ARTIFACT_VIEWER_ROLE.to_string()]
    }

    pub fn actions_for(&self, role: &str) -> &'static [Action] {
        if role == self.project_role {
            &[Action::Submit, Action::ReadStatus, Action::Cancel]
        } else if role == ARTIFACT_VIEWER_ROLE {
            &[Action::FetchArtifacts]
        } else {
            &[]
        }
    }

    /// Deny unless one of the target project's bindings grants `action` to
    /// the caller. The operator is allowed everything.
    pub fn authorize(
        &self,
        principal: &Principal,
        bindings: &[RoleBinding],
        action: Action,
    ) -> Decision {
        if *principal == Principal::Operator {
            return Decision::Allow;
        }

        let member = principal.member();
        let granted = bindings
            .iter()
            .filter(|binding| binding.principal == member)
            .any(|binding| self.actions_for(&binding.role).contains(&action));

        if granted {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::service_account_member;

    const EMAIL: &str = "orchestrate@tenant-p1.iam.gserviceaccount.com";

    fn tenant() -> Principal {
        Principal::ServiceAccount {
            project_id: "tenant-p1".to_string(),
            email: EMAIL.to_string(),
        }
    }

    fn binding(role: &str, email: &str) -> RoleBinding {
        RoleBinding {
            role: role.to_string(),
            principal: service_account_member(email),
        }
    }

    #[test]
    fn test_project_role_grants_workflow_actions() {
        let policy = AccessPolicy::new("orchestrate-main");
        let bindings = vec![binding(policy.project_role(), EMAIL)];

        assert_eq!(
            policy.project_role(),
            "projects/orchestrate-main/roles/orchestrate.project"
        );
        for action in [Action::Submit, Action::ReadStatus, Action::Cancel] {
            assert_eq!(policy.authorize(&tenant(), &bindings, action), Decision::Allow);
        }
        assert_eq!(
            policy.authorize(&tenant(), &bindings, Action::FetchArtifacts),
            Decision::Deny
        );
    }

    #[test]
    fn test_artifact_viewer_only_fetches() {
        let policy = AccessPolicy::new("orchestrate-main");
        let bindings = vec![binding(ARTIFACT_VIEWER_ROLE, EMAIL)];

        assert!(policy
            .authorize(&tenant(), &bindings, Action::FetchArtifacts)
            .is_allowed());
        assert!(!policy.authorize(&tenant(), &bindings, Action::Submit).is_allowed());
    }

    #[test]
    fn test_deny_by_default() {
        let policy = AccessPolicy::new("orchestrate-main");

        assert_eq!(policy.authorize(&tenant(), &[], Action::Submit), Decision::Deny);

        // Binding for somebody else
        let bindings = vec![binding(
            policy.project_role(),
            "orchestrate@tenant-p2.iam.gserviceaccount.com",
        )];
        assert_eq!(
            policy.authorize(&tenant(), &bindings, Action::Submit),
            Decision::Deny
        );

        // Unknown role
        let bindings = vec![binding("roles/owner", EMAIL)];
        assert_eq!(
            policy.authorize(&tenant(), &bindings, Action::Submit),
            Decision::Deny
        );
    }

    #[test]
    fn test_operator_allowed_everything() {
        let policy = AccessPolicy::new("orchestrate-main");

        assert_eq!(
            policy.authorize(&Principal::Operator, &[], Action::Cancel),
            Decision::Allow
        );
    }
}
