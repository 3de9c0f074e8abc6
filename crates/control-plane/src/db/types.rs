use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, UnknownVariant> {
                value.parse()
            }
        }
    };
}

text_enum!(UserType {
    Admin => "admin",
    Member => "member",
    Viewer => "viewer",
});

text_enum!(ApplicationStatus {
    Created => "created",
    Deploying => "deploying",
    Running => "running",
    Stopped => "stopped",
    Failed => "failed",
});

text_enum!(HealthStatus {
    Healthy => "healthy",
    Degraded => "degraded",
});

text_enum!(BuildPack {
    Dockerfile => "dockerfile",
    Compose => "compose",
    Static => "static",
    Nixpacks => "nixpacks",
});

text_enum!(Environment {
    Production => "production",
    Staging => "staging",
    Development => "development",
    LiveDev => "live-dev",
});

text_enum!(
    /// Lifecycle of one deployment attempt.
    DeploymentStatus {
        Queued => "queued",
        Cloning => "cloning",
        Building => "building",
        Starting => "starting",
        HealthCheck => "health_check",
        Live => "live",
        Failed => "failed",
        RolledBack => "rolled_back",
        Restarting => "restarting",
        Superseded => "superseded",
    }
);

text_enum!(DeploymentTrigger {
    Create => "create",
    Redeploy => "redeploy",
    Rollback => "rollback",
    Restart => "restart",
});

text_enum!(LogLevel {
    Info => "info",
    Warn => "warn",
    Error => "error",
    Debug => "debug",
});

text_enum!(HealthcheckKind {
    Http => "http",
    Tcp => "tcp",
});

text_enum!(JobStatus {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

text_enum!(ExecutionStatus {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    RolledBack => "rolled_back",
});

text_enum!(PermissionAction {
    Create => "create",
    Read => "read",
    Update => "update",
    Delete => "delete",
});

impl DeploymentStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Live | Self::Failed | Self::RolledBack | Self::Superseded
        )
    }

    /// Whether a deployment currently routes traffic for its application.
    #[must_use]
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Live | Self::RolledBack)
    }

    /// Allowed forward moves. Nothing ever moves backwards.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeploymentStatus::{
            Building, Cloning, Failed, HealthCheck, Live, Queued, Restarting, RolledBack,
            Starting, Superseded,
        };

        matches!(
            (self, next),
            (Queued, Cloning | Restarting | Failed)
                | (Cloning, Building | Failed)
                | (Building, Starting | Failed)
                | (Starting, HealthCheck | Failed)
                | (HealthCheck, Live | RolledBack | Failed)
                | (Restarting, Live | RolledBack | Failed)
                | (Live | RolledBack, Superseded)
        )
    }
}

/// JSON-encoded `TEXT` column holding a string map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringMap(pub BTreeMap<String, String>);

impl StringMap {
    /// # Errors
    ///
    /// Returns an error if the map cannot be encoded.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }
}

impl Deref for StringMap {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for StringMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl TryFrom<String> for StringMap {
    type Error = serde_json::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_str(&value).map(Self)
    }
}

impl From<BTreeMap<String, String>> for StringMap {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

/// Validated `page`/`page_size` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub const MAX_PAGE_SIZE: u32 = 200;

    #[must_use]
    pub fn limit(self) -> i64 {
        i64::from(self.page_size.min(Self::MAX_PAGE_SIZE))
    }

    #[must_use]
    pub fn offset(self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * self.limit()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct OrganizationRecord {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewUser {
    pub id: String,
    pub external_id: String,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub user_type: UserType,
}

#[derive(Clone, Serialize, FromRow)]
pub struct UserRecord {
    pub id: String,
    pub external_id: String,
    pub email: String,
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    #[sqlx(try_from = "String")]
    pub user_type: UserType,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UserRecord")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("user_type", &self.user_type)
            .field("password_hash", &"***")
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct RoleRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub organization_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct PermissionRecord {
    pub id: String,
    pub resource: String,
    #[sqlx(try_from = "String")]
    pub action: PermissionAction,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct MembershipRecord {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub role_id: String,
    pub role_name: String,
}

#[derive(Clone, Serialize, FromRow)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    pub prefix: String,
    #[serde(skip)]
    pub hashed_secret: String,
    pub label: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for ApiKeyRecord {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ApiKeyRecord")
            .field("id", &self.id)
            .field("prefix", &self.prefix)
            .field("organization_id", &self.organization_id)
            .field("hashed_secret", &"***")
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct FeatureFlagRecord {
    pub organization_id: String,
    pub feature_name: String,
    pub enabled: bool,
}

/// One audit row, written in the same transaction as the mutation it records.
#[derive(Clone, Debug)]
pub struct NewAuditLog {
    pub actor_user_id: String,
    pub organization_id: String,
    pub resource: String,
    pub action: String,
    pub target_id: Option<String>,
    pub payload_snapshot: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct AuditLogRecord {
    pub id: String,
    pub actor_user_id: String,
    pub organization_id: String,
    pub resource: String,
    pub action: String,
    pub target_id: Option<String>,
    pub payload_snapshot: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewApplication {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub family_id: Option<String>,
    pub name: String,
    pub repository: String,
    pub branch: String,
    pub build_pack: BuildPack,
    pub dockerfile_path: Option<String>,
    pub base_path: Option<String>,
    pub port: u16,
    pub domain: Option<String>,
    pub environment: Environment,
    pub framework: Option<String>,
    pub pre_run_command: String,
    pub post_run_command: String,
    pub build_variables: StringMap,
    pub environment_variables: StringMap,
    pub labels: StringMap,
}

/// Stored-field changes; `None` leaves a field untouched.
#[derive(Clone, Debug, Default)]
pub struct ApplicationUpdate {
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub build_pack: Option<BuildPack>,
    pub dockerfile_path: Option<String>,
    pub base_path: Option<String>,
    pub port: Option<u16>,
    pub domain: Option<String>,
    pub framework: Option<String>,
    pub pre_run_command: Option<String>,
    pub post_run_command: Option<String>,
    pub build_variables: Option<StringMap>,
    pub environment_variables: Option<StringMap>,
    pub labels: Option<StringMap>,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct ApplicationRecord {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub family_id: Option<String>,
    pub name: String,
    pub repository: String,
    pub branch: String,
    #[sqlx(try_from = "String")]
    pub build_pack: BuildPack,
    pub dockerfile_path: Option<String>,
    pub base_path: Option<String>,
    pub port: i64,
    pub domain: Option<String>,
    #[sqlx(try_from = "String")]
    pub environment: Environment,
    pub framework: Option<String>,
    pub pre_run_command: String,
    pub post_run_command: String,
    #[sqlx(try_from = "String")]
    pub build_variables: StringMap,
    #[sqlx(try_from = "String")]
    pub environment_variables: StringMap,
    #[sqlx(try_from = "String")]
    pub labels: StringMap,
    #[sqlx(try_from = "String")]
    pub status: ApplicationStatus,
    #[sqlx(try_from = "String")]
    pub health_status: HealthStatus,
    pub last_deployment_failed: bool,
    pub current_deployment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationRecord {
    /// Port as stored; rows are only ever written from a `u16`.
    #[must_use]
    pub fn port(&self) -> u16 {
        u16::try_from(self.port).unwrap_or_default()
    }
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct DeploymentRecord {
    pub id: String,
    pub application_id: String,
    pub commit_hash: Option<String>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub container_image: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: DeploymentStatus,
    #[sqlx(try_from = "String")]
    pub trigger: DeploymentTrigger,
    pub rollback_of: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Container facts recorded on a deployment once they are known.
#[derive(Clone, Debug, Default)]
pub struct DeploymentArtifacts {
    pub commit_hash: Option<String>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub container_image: Option<String>,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct DeploymentLogRecord {
    pub id: i64,
    pub deployment_id: String,
    #[sqlx(try_from = "String")]
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct DomainRecord {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Encrypted-at-rest repository app credential.
#[derive(Clone, FromRow)]
pub struct RepoCredentialRecord {
    pub id: String,
    pub organization_id: String,
    pub app_id: String,
    pub installation_id: String,
    pub private_key_encrypted: String,
    pub client_id: String,
    pub client_secret_encrypted: String,
    pub webhook_secret_encrypted: String,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for RepoCredentialRecord {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RepoCredentialRecord")
            .field("organization_id", &self.organization_id)
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("client_id", &self.client_id)
            .field("private_key_encrypted", &"***")
            .field("client_secret_encrypted", &"***")
            .field("webhook_secret_encrypted", &"***")
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct NewHealthcheck {
    pub id: String,
    pub application_id: String,
    pub kind: HealthcheckKind,
    pub target: String,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub threshold: u32,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct HealthcheckRecord {
    pub id: String,
    pub application_id: String,
    #[sqlx(try_from = "String")]
    pub kind: HealthcheckKind,
    pub target: String,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub threshold: i64,
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct HealthcheckResultRecord {
    pub id: i64,
    pub healthcheck_id: String,
    pub timestamp: DateTime<Utc>,
    pub ok: bool,
    pub latency_ms: i64,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct JobRecord {
    pub seq: i64,
    pub id: String,
    pub queue: String,
    pub job_key: String,
    pub payload: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct ExtensionRecord {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: String,
    pub spec: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct ExtensionExecutionRecord {
    pub id: String,
    pub extension_id: String,
    pub organization_id: String,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub variables: String,
    pub output: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
