//! Account provisioning inside a running node

use super::controller::{LifecycleController, StackState};
use super::definition::{validate_name, AccountIdentity, ServiceSpec};
use crate::error::{Result, StackError};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

/// Key generation command used when a node service declares none
pub const DEFAULT_KEYGEN: &[&str] = &[
    "geth",
    "account",
    "new",
    "--password",
    "/dev/null",
    "--datadir",
    "/data",
];

/// Placeholder replaced by the account name in keygen commands
pub const ACCOUNT_PLACEHOLDER: &str = "{account}";

/// Provisions signing identities for a stack's organizations
pub struct AccountProvisioner<'a> {
    controller: &'a LifecycleController,
}

impl<'a> AccountProvisioner<'a> {
    pub fn new(controller: &'a LifecycleController) -> Self {
        Self { controller }
    }

    /// Generate a key inside the organization's node and register it.
    ///
    /// Nothing is persisted unless the in-container command succeeded and
    /// its output parsed into an identity.
    pub async fn create_account(&self, organization: &str, account: &str) -> Result<AccountIdentity> {
        validate_name("account", account)?;

        let (capability, mut definition) = self.controller.prepare()?;

        let service = definition
            .organization_service(organization)
            .ok_or_else(|| StackError::UnknownOrganization(organization.to_string()))?
            .clone();

        if definition.account(organization, account).is_some() {
            return Err(StackError::DuplicateAccount {
                organization: organization.to_string(),
                account: account.to_string(),
            });
        }

        let state = self.controller.live_state(&capability, &definition).await?;
        if state != StackState::Running {
            return Err(StackError::StackNotRunning(definition.name.clone()));
        }

        let command = keygen_command(&service, account);
        tracing::debug!(
            "Generating key for {}/{} in service {}",
            organization,
            account,
            service.name
        );

        let dir = self.controller.store().stack_dir(&definition.name);
        let call = self.controller.call(&capability, &definition, &dir);
        let timeout = self.controller.context().settings().exec_timeout();
        let stdout = self
            .controller
            .runtime()
            .exec(&call, &service.name, &command, timeout)
            .await
            .map_err(|e| match e {
                StackError::Cancelled => StackError::Cancelled,
                StackError::Runtime(msg) => StackError::ProvisionFailed(format!(
                    "key generation in '{}' failed: {}",
                    service.name,
                    msg.trim()
                )),
                other => other,
            })?;

        let (address, key_ref) = parse_keygen_output(&stdout)?;
        let identity = AccountIdentity {
            organization: organization.to_string(),
            name: account.to_string(),
            address,
            key_ref,
            created_at: Utc::now(),
        };

        definition.insert_account(identity.clone())?;
        self.controller.store().save(&definition)?;

        tracing::info!(
            "Created account {}/{} with address {}",
            organization,
            account,
            identity.address
        );
        Ok(identity)
    }

    /// Registered accounts, optionally for one organization
    pub fn list_accounts(&self, organization: Option<&str>) -> Result<Vec<AccountIdentity>> {
        let definition = self.controller.definition()?;
        if let Some(org) = organization {
            if definition.organization_service(org).is_none() && !definition.accounts.contains_key(org) {
                return Err(StackError::UnknownOrganization(org.to_string()));
            }
        }
        Ok(definition
            .accounts_for(organization)
            .into_iter()
            .cloned()
            .collect())
    }
}

impl LifecycleController {
    /// Provision an account; see [`AccountProvisioner::create_account`]
    pub async fn create_account(&self, organization: &str, account: &str) -> Result<AccountIdentity> {
        AccountProvisioner::new(self)
            .create_account(organization, account)
            .await
    }
}

fn keygen_command(service: &ServiceSpec, account: &str) -> Vec<String> {
    match &service.keygen {
        Some(template) => template
            .iter()
            .map(|arg| arg.replace(ACCOUNT_PLACEHOLDER, account))
            .collect(),
        None => DEFAULT_KEYGEN.iter().map(|s| s.to_string()).collect(),
    }
}

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("address regex is valid"));

static GETH_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Public address of the key:\s*(0x[0-9a-fA-F]+)").expect("regex is valid")
});

static GETH_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Path of the secret key file:\s*(\S+)").expect("regex is valid"));

/// Extract `(address, key_ref)` from key generation output.
///
/// Accepts a JSON object, alone or as the last `{...}` line, or geth's
/// `account new` text.
pub fn parse_keygen_output(stdout: &str) -> Result<(String, String)> {
    let (address, key_ref) = parse_json_output(stdout)
        .or_else(|| parse_geth_output(stdout))
        .ok_or_else(|| {
            StackError::ProvisionFailed(format!(
                "unrecognized key generation output: {}",
                summarize(stdout)
            ))
        })?;

    if !ADDRESS_RE.is_match(&address) {
        return Err(StackError::ProvisionFailed(format!(
            "key generation returned an invalid address '{}'",
            address
        )));
    }
    if key_ref.trim().is_empty() {
        return Err(StackError::ProvisionFailed(
            "key generation returned no key reference".to_string(),
        ));
    }

    Ok((address, key_ref))
}

fn parse_json_output(stdout: &str) -> Option<(String, String)> {
    let trimmed = stdout.trim();
    let value: serde_json::Value = serde_json::from_str(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| line.starts_with('{'))
            .and_then(|line| serde_json::from_str(line).ok())
    })?;

    let address = value.get("address")?.as_str()?.to_string();
    let key_ref = ["keyRef", "key_ref", "path", "privateKeyPath"]
        .iter()
        .find_map(|field| value.get(*field).and_then(|v| v.as_str()))?
        .to_string();
    Some((address, key_ref))
}

fn parse_geth_output(stdout: &str) -> Option<(String, String)> {
    let address = GETH_ADDRESS_RE.captures(stdout)?.get(1)?.as_str().to_string();
    let key_ref = GETH_PATH_RE.captures(stdout)?.get(1)?.as_str().to_string();
    Some((address, key_ref))
}

fn summarize(stdout: &str) -> String {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let mut summary: String = trimmed.chars().take(120).collect();
    if summary.len() < trimmed.len() {
        summary.push_str("...");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::runtime::testing::{probed_context, FakeRuntime};
    use crate::runtime::ServiceHealth;
    use crate::stack::definition::tests::service;
    use crate::stack::StackDefinition;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const ADDRESS: &str = "0x5b38Da6a701c568545dCfcB03FcB875f56beddC4";

    const GETH_OUTPUT: &str = "Your new key was generated

Public address of the key:   0x5b38Da6a701c568545dCfcB03FcB875f56beddC4
Path of the secret key file: /data/keystore/UTC--2024-05-01T10-00-00.000000000Z--5b38da6a

- You can share your public address with anyone. Others need it to interact with you.
";

    async fn running_stack(temp: &TempDir, runtime: &Arc<FakeRuntime>) -> LifecycleController {
        let settings = Settings {
            stacks_dir: temp.path().to_path_buf(),
            health_timeout_secs: 1,
            poll_interval_ms: 10,
            ..Settings::default()
        };
        let controller = LifecycleController::new(
            Arc::new(probed_context(settings)),
            runtime.clone(),
            "test1",
            temp.path(),
        );

        let mut node = service("node1", &[]);
        node.organization = Some("org1".to_string());
        let def = StackDefinition::new("test1", vec![node, service("db", &[])]).unwrap();
        controller.create(def).await.unwrap();
        controller.start().await.unwrap();
        controller
    }

    #[test]
    fn test_parse_geth_output() {
        let (address, key_ref) = parse_keygen_output(GETH_OUTPUT).unwrap();
        assert_eq!(address, ADDRESS);
        assert!(key_ref.starts_with("/data/keystore/UTC--"));
    }

    #[test]
    fn test_parse_json_output() {
        let json = format!(r#"{{"address":"{}","keyRef":"kms://signer/acct1"}}"#, ADDRESS);
        assert_eq!(
            parse_keygen_output(&json).unwrap(),
            (ADDRESS.to_string(), "kms://signer/acct1".to_string())
        );

        let noisy = format!("INFO starting signer\n{{\"address\":\"{}\",\"path\":\"/keys/a\"}}\n", ADDRESS);
        assert_eq!(parse_keygen_output(&noisy).unwrap().1, "/keys/a");
    }

    #[test]
    fn test_parse_rejects_bad_output() {
        assert!(parse_keygen_output("").is_err());
        assert!(parse_keygen_output("Fatal: could not open keystore").is_err());
        assert!(parse_keygen_output(r#"{"address":"0x1234","keyRef":"x"}"#).is_err());
        // raw key without a reference is not accepted
        assert!(parse_keygen_output(&format!(
            r#"{{"address":"{}","privateKey":"0xabc"}}"#,
            ADDRESS
        ))
        .is_err());
    }

    #[test]
    fn test_keygen_template() {
        let mut svc = service("signer", &[]);
        assert_eq!(keygen_command(&svc, "a1")[0], "geth");

        svc.keygen = Some(vec!["ffsigner".to_string(), "new-key".to_string(), "--name={account}".to_string()]);
        assert_eq!(keygen_command(&svc, "a1"), vec!["ffsigner", "new-key", "--name=a1"]);
    }

    #[tokio::test]
    async fn test_create_account_on_running_stack() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Ok(GETH_OUTPUT));
        let controller = running_stack(&temp, &runtime).await;

        let identity = controller.create_account("org1", "acct1").await.unwrap();

        assert_eq!(identity.organization, "org1");
        assert_eq!(identity.name, "acct1");
        assert!(!identity.address.is_empty());

        let def = controller.definition().unwrap();
        assert_eq!(def.accounts.get("org1").unwrap().len(), 1);
        assert_eq!(def.account("org1", "acct1"), Some(&identity));
        assert_eq!(runtime.exec_calls()[0].0, "node1");
    }

    #[tokio::test]
    async fn test_duplicate_account() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Ok(GETH_OUTPUT));
        let controller = running_stack(&temp, &runtime).await;

        controller.create_account("org1", "acct1").await.unwrap();
        let err = controller.create_account("org1", "acct1").await.unwrap_err();

        assert!(matches!(err, StackError::DuplicateAccount { .. }));
        assert_eq!(controller.definition().unwrap().account_count(), 1);
        assert_eq!(runtime.exec_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_exec_persists_nothing() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Err("keystore locked"));
        let controller = running_stack(&temp, &runtime).await;
        let path = controller.store().definition_path("test1");
        let before = std::fs::read(&path).unwrap();

        let err = controller.create_account("org1", "acct1").await.unwrap_err();

        assert!(matches!(err, StackError::ProvisionFailed(_)));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_save_persists_nothing() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Ok(GETH_OUTPUT));
        let controller = running_stack(&temp, &runtime).await;
        let path = controller.store().definition_path("test1");
        let backup = path.with_extension("bak");
        let before = std::fs::read(&path).unwrap();

        // A directory squatting on stack.json makes the final rename fail
        let (squat, moved) = (path.clone(), backup.clone());
        runtime.on_exec(move || {
            std::fs::rename(&squat, &moved).unwrap();
            std::fs::create_dir(&squat).unwrap();
            std::fs::write(squat.join("keep"), b"").unwrap();
        });

        let err = controller.create_account("org1", "acct1").await.unwrap_err();
        assert!(matches!(err, StackError::PersistenceError { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(controller.store().stack_dir("test1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());

        std::fs::remove_dir_all(&path).unwrap();
        std::fs::rename(&backup, &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(controller.definition().unwrap().account_count(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_output_persists_nothing() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Ok("something unexpected"));
        let controller = running_stack(&temp, &runtime).await;

        let err = controller.create_account("org1", "acct1").await.unwrap_err();

        assert!(matches!(err, StackError::ProvisionFailed(_)));
        assert_eq!(controller.definition().unwrap().account_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_organization() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Ok(GETH_OUTPUT));
        let controller = running_stack(&temp, &runtime).await;

        let err = controller.create_account("org9", "acct1").await.unwrap_err();
        assert!(matches!(err, StackError::UnknownOrganization(ref o) if o == "org9"));
        assert!(runtime.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_requires_running_stack() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Ok(GETH_OUTPUT));
        let controller = running_stack(&temp, &runtime).await;

        runtime.set_health("db", ServiceHealth::Unhealthy);
        let err = controller.create_account("org1", "acct1").await.unwrap_err();
        assert!(matches!(err, StackError::StackNotRunning(_)));

        controller.stop().await.unwrap();
        let err = controller.create_account("org1", "acct1").await.unwrap_err();
        assert!(matches!(err, StackError::StackNotRunning(_)));
        assert!(runtime.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_list_accounts() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_output(Ok(GETH_OUTPUT));
        let controller = running_stack(&temp, &runtime).await;
        controller.create_account("org1", "acct1").await.unwrap();

        let provisioner = AccountProvisioner::new(&controller);
        assert_eq!(provisioner.list_accounts(None).unwrap().len(), 1);
        assert_eq!(provisioner.list_accounts(Some("org1")).unwrap().len(), 1);
        assert!(provisioner.list_accounts(Some("db")).unwrap().is_empty());
        assert!(matches!(
            provisioner.list_accounts(Some("nobody")),
            Err(StackError::UnknownOrganization(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_account_name() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let controller = running_stack(&temp, &runtime).await;

        assert!(matches!(
            controller.create_account("org1", "../escape").await,
            Err(StackError::InvalidDefinition(_))
        ));
    }
}
