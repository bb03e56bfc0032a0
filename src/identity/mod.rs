//! Cloud identity lifecycle for managed runtimes
//!
//! The managed-cloud variants need roles, policies and an access key in place
//! before infrastructure creation starts. Every creation here has an exact
//! structural inverse, and the orchestrator registers that inverse with the
//! compensation context immediately after the creation succeeds - never
//! batched at the end of the run.
//!
//! Deletion tolerates "not found": teardown may run after a partial creation,
//! and a role that was never created (or was already removed by an earlier
//! compensation attempt) must not fail the overall teardown.
//!
//! Calls go through the `aws` CLI with JSON output, the same way the rest of
//! the codebase drives `kind` and `az`.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, ROLE_PROPAGATION_ATTEMPTS, ROLE_PROPAGATION_DELAY};

/// Inverse-side view of the identity manager, consumed by the compensator.
///
/// Only teardown crosses this seam; creation stays on the concrete client so
/// the orchestrator keeps access to the fine-grained operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityManager: Send + Sync {
    /// Remove every identity resource created for an instance, best-effort.
    /// Resources that no longer exist are skipped, not errors.
    async fn teardown(&self, instance: &str) -> Result<()>;
}

/// Name of the role allowed to manage infrastructure resources for an instance
pub fn resource_manager_role(instance: &str) -> String {
    format!("stratus-resource-manager-{}", instance)
}

/// Name of the role the managed runtime's control plane assumes
pub fn runtime_management_role(instance: &str) -> String {
    format!("stratus-runtime-manager-{}", instance)
}

/// Name of the policy attached to the runtime management role
pub fn runtime_policy(instance: &str) -> String {
    format!("stratus-runtime-policy-{}", instance)
}

/// Name of the service-account user holding the instance's access key
pub fn service_account_user(instance: &str) -> String {
    format!("stratus-svc-{}", instance)
}

/// An access key issued for an instance's service account
#[derive(Debug, Clone)]
pub struct AccessKey {
    /// Key id
    pub id: String,
    /// Key secret
    pub secret: String,
}

/// IAM client for the AWS variant, addressed by local profile and region
#[derive(Debug, Clone)]
pub struct AwsIdentityClient {
    command: std::path::PathBuf,
    profile: String,
    region: String,
}

impl AwsIdentityClient {
    /// Create a client using the given local profile and region
    pub fn new(profile: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            command: std::path::PathBuf::from("aws"),
            profile: profile.into(),
            region: region.into(),
        }
    }

    /// Point the client at a different CLI binary
    #[cfg(test)]
    fn with_command(mut self, command: impl Into<std::path::PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    /// Run an `aws` CLI call and return stdout. Stderr is preserved in the
    /// error so not-found classification can inspect it.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.command)
            .args(args)
            .args(["--profile", &self.profile, "--region", &self.region])
            .args(["--output", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::identity(format!("failed to run aws {}: {}", args.join(" "), e)))?;

        if !output.status.success() {
            return Err(Error::identity(format!(
                "aws {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// The account id of the configured profile
    pub async fn account_id(&self) -> Result<String> {
        let out = self.run(&["sts", "get-caller-identity"]).await?;
        let value: serde_json::Value = serde_json::from_str(&out)?;
        value
            .get("Account")
            .and_then(|a| a.as_str())
            .map(String::from)
            .ok_or_else(|| Error::identity("get-caller-identity returned no Account"))
    }

    /// Create the role allowed to create and delete infrastructure resources
    /// for this instance. Returns the role ARN.
    pub async fn create_resource_manager_role(&self, instance: &str) -> Result<String> {
        let account = self.account_id().await?;
        let trust = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "AWS": format!("arn:aws:iam::{}:root", account) },
                "Action": "sts:AssumeRole"
            }]
        });
        let role = resource_manager_role(instance);
        let out = self
            .run(&[
                "iam",
                "create-role",
                "--role-name",
                &role,
                "--assume-role-policy-document",
                &trust.to_string(),
            ])
            .await?;
        let value: serde_json::Value = serde_json::from_str(&out)?;
        let arn = value
            .pointer("/Role/Arn")
            .and_then(|a| a.as_str())
            .map(String::from)
            .ok_or_else(|| Error::identity("create-role returned no Arn"))?;

        info!(role = %role, "Created resource manager role");
        self.wait_for_role_propagation(&role).await?;
        Ok(arn)
    }

    /// Delete the resource manager role. Succeeds if the role is already gone.
    pub async fn delete_resource_manager_role(&self, instance: &str) -> Result<()> {
        self.delete_role(&resource_manager_role(instance)).await
    }

    /// Create the role the managed runtime's control plane assumes, with its
    /// policy attached. Returns the role ARN.
    pub async fn create_runtime_management_role(&self, instance: &str) -> Result<String> {
        let trust = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "eks.amazonaws.com" },
                "Action": "sts:AssumeRole"
            }]
        });
        let role = runtime_management_role(instance);
        let out = self
            .run(&[
                "iam",
                "create-role",
                "--role-name",
                &role,
                "--assume-role-policy-document",
                &trust.to_string(),
            ])
            .await?;
        let value: serde_json::Value = serde_json::from_str(&out)?;
        let arn = value
            .pointer("/Role/Arn")
            .and_then(|a| a.as_str())
            .map(String::from)
            .ok_or_else(|| Error::identity("create-role returned no Arn"))?;

        self.run(&[
            "iam",
            "attach-role-policy",
            "--role-name",
            &role,
            "--policy-arn",
            "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
        ])
        .await?;

        info!(role = %role, "Created runtime management role");
        self.wait_for_role_propagation(&role).await?;
        Ok(arn)
    }

    /// Delete the runtime management role, detaching its policy first.
    /// Succeeds if either is already gone.
    pub async fn delete_runtime_management_role(&self, instance: &str) -> Result<()> {
        let role = runtime_management_role(instance);
        let detach = self
            .run(&[
                "iam",
                "detach-role-policy",
                "--role-name",
                &role,
                "--policy-arn",
                "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
            ])
            .await;
        if let Err(e) = detach {
            if !is_not_found(&e) {
                return Err(e);
            }
        }
        self.delete_role(&role).await
    }

    /// Create the customer-managed policy scoping what the instance's service
    /// account may do. Returns the policy ARN.
    pub async fn create_runtime_policy(&self, instance: &str) -> Result<String> {
        let policy = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": ["eks:*", "ec2:Describe*", "iam:GetRole", "iam:PassRole"],
                "Resource": "*"
            }]
        });
        let name = runtime_policy(instance);
        let out = self
            .run(&[
                "iam",
                "create-policy",
                "--policy-name",
                &name,
                "--policy-document",
                &policy.to_string(),
            ])
            .await?;
        let value: serde_json::Value = serde_json::from_str(&out)?;
        value
            .pointer("/Policy/Arn")
            .and_then(|a| a.as_str())
            .map(String::from)
            .ok_or_else(|| Error::identity("create-policy returned no Arn"))
    }

    /// Delete the runtime policy by ARN. Succeeds if already gone.
    pub async fn delete_runtime_policy(&self, policy_arn: &str) -> Result<()> {
        match self
            .run(&["iam", "delete-policy", "--policy-arn", policy_arn])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(policy = %policy_arn, "Policy already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create the service-account user and issue it an access key
    pub async fn create_service_account(&self, instance: &str) -> Result<AccessKey> {
        let user = service_account_user(instance);
        self.run(&["iam", "create-user", "--user-name", &user])
            .await?;
        let out = self
            .run(&["iam", "create-access-key", "--user-name", &user])
            .await?;
        let value: serde_json::Value = serde_json::from_str(&out)?;
        let id = value
            .pointer("/AccessKey/AccessKeyId")
            .and_then(|a| a.as_str())
            .map(String::from)
            .ok_or_else(|| Error::identity("create-access-key returned no AccessKeyId"))?;
        let secret = value
            .pointer("/AccessKey/SecretAccessKey")
            .and_then(|a| a.as_str())
            .map(String::from)
            .ok_or_else(|| Error::identity("create-access-key returned no SecretAccessKey"))?;
        info!(user = %user, "Created service account");
        Ok(AccessKey { id, secret })
    }

    /// Delete the service-account user and its access keys. Succeeds if
    /// already gone.
    ///
    /// Keys are enumerated and removed first: IAM refuses to delete a user
    /// that still holds an access key.
    pub async fn delete_service_account(&self, instance: &str) -> Result<()> {
        let user = service_account_user(instance);
        match self
            .run(&["iam", "list-access-keys", "--user-name", &user])
            .await
        {
            Ok(out) => {
                let value: serde_json::Value = serde_json::from_str(&out)?;
                let keys = value
                    .pointer("/AccessKeyMetadata")
                    .and_then(|k| k.as_array())
                    .cloned()
                    .unwrap_or_default();
                for key in keys {
                    let Some(id) = key.pointer("/AccessKeyId").and_then(|i| i.as_str()) else {
                        continue;
                    };
                    let res = self
                        .run(&[
                            "iam",
                            "delete-access-key",
                            "--user-name",
                            &user,
                            "--access-key-id",
                            id,
                        ])
                        .await;
                    if let Err(e) = res {
                        if !is_not_found(&e) {
                            return Err(e);
                        }
                    }
                }
            }
            // User already gone, so its keys are too
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
        }
        match self.run(&["iam", "delete-user", "--user-name", &user]).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_role(&self, role: &str) -> Result<()> {
        match self
            .run(&["iam", "delete-role", "--role-name", role])
            .await
        {
            Ok(_) => {
                info!(role = %role, "Deleted role");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(role = %role, "Role already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until a freshly created role is visible. IAM writes propagate
    /// eventually; creating dependent resources too early fails spuriously.
    async fn wait_for_role_propagation(&self, role: &str) -> Result<()> {
        let config = RetryConfig::fixed(ROLE_PROPAGATION_ATTEMPTS, ROLE_PROPAGATION_DELAY);
        retry_with_backoff(&config, "wait_for_role_propagation", || async {
            self.run(&["iam", "get-role", "--role-name", role])
                .await
                .map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl IdentityManager for AwsIdentityClient {
    async fn teardown(&self, instance: &str) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(e) = self.delete_service_account(instance).await {
            failures.push(format!("service account: {}", e));
        }
        // The policy ARN is account-scoped and name-derived, so it can be
        // reconstructed without any persisted state
        match self.account_id().await {
            Ok(account) => {
                let arn = format!(
                    "arn:aws:iam::{}:policy/{}",
                    account,
                    runtime_policy(instance)
                );
                if let Err(e) = self.delete_runtime_policy(&arn).await {
                    failures.push(format!("runtime policy: {}", e));
                }
            }
            Err(e) => failures.push(format!("runtime policy: {}", e)),
        }
        if let Err(e) = self.delete_runtime_management_role(instance).await {
            failures.push(format!("runtime management role: {}", e));
        }
        if let Err(e) = self.delete_resource_manager_role(instance).await {
            failures.push(format!("resource manager role: {}", e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::teardown(failures.join("; ")))
        }
    }
}

/// Classify an error as "the resource no longer exists".
///
/// AWS reports this as NoSuchEntity; Azure as ResourceNotFound. Both count as
/// success for a delete.
pub fn is_not_found(err: &Error) -> bool {
    let msg = err.to_string();
    msg.contains("NoSuchEntity")
        || msg.contains("NotFoundException")
        || msg.contains("ResourceNotFound")
        || msg.contains("cannot be found")
        || msg.contains("could not be found")
        || msg.contains("does not exist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_are_instance_scoped() {
        assert_eq!(
            resource_manager_role("dev"),
            "stratus-resource-manager-dev"
        );
        assert_eq!(
            runtime_management_role("dev"),
            "stratus-runtime-manager-dev"
        );
        assert_eq!(runtime_policy("dev"), "stratus-runtime-policy-dev");
        assert_eq!(service_account_user("dev"), "stratus-svc-dev");
    }

    #[test]
    fn not_found_classification_covers_both_clouds() {
        let aws = Error::identity(
            "aws iam delete-role failed: An error occurred (NoSuchEntity) when calling \
             the DeleteRole operation: The role with name stratus-resource-manager-dev \
             cannot be found.",
        );
        assert!(is_not_found(&aws));

        let azure = Error::identity(
            "az role assignment delete failed: (ResourceNotFound) the specified \
             assignment was not found",
        );
        assert!(is_not_found(&azure));

        let throttle = Error::identity("aws iam delete-role failed: Throttling");
        assert!(!is_not_found(&throttle));
    }

    #[test]
    fn access_denied_is_not_treated_as_deleted() {
        let err = Error::identity(
            "aws iam delete-role failed: An error occurred (AccessDenied) when calling \
             the DeleteRole operation",
        );
        assert!(!is_not_found(&err));
    }

    /// Shell stand-in for the `aws` CLI: appends every invocation to a log
    /// file and answers the calls teardown needs JSON for.
    fn stub_cli(dir: &std::path::Path, log: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            r#"#!/bin/sh
echo "$@" >> {log}
case "$1 $2" in
  "sts get-caller-identity") echo '{{"Account":"123456789012"}}' ;;
  "iam list-access-keys") echo '{{"AccessKeyMetadata":[{{"AccessKeyId":"AKIAEXAMPLE"}}]}}' ;;
  *) echo '{{}}' ;;
esac
"#,
            log = log.display()
        );
        let path = dir.join("aws-stub");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn teardown_removes_policy_and_access_keys_before_user() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("calls.log");
        let client = AwsIdentityClient::new("default", "us-east-1")
            .with_command(stub_cli(dir.path(), &log));

        client.teardown("dev").await.unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();

        // The customer-managed policy is deleted by its reconstructed ARN
        assert!(
            calls.contains(
                "delete-policy --policy-arn \
                 arn:aws:iam::123456789012:policy/stratus-runtime-policy-dev"
            ),
            "calls: {}",
            calls
        );

        // Access keys go before the user, which IAM requires
        let lines: Vec<&str> = calls.lines().collect();
        let key = lines.iter().position(|l| l.contains("delete-access-key"));
        let user = lines.iter().position(|l| l.contains("delete-user"));
        assert!(key.is_some() && user.is_some(), "calls: {}", calls);
        assert!(key < user);

        // Both roles still get their deletes
        assert!(calls.contains("delete-role --role-name stratus-runtime-manager-dev"));
        assert!(calls.contains("delete-role --role-name stratus-resource-manager-dev"));
    }
}
