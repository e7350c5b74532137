//! The downstream services a user's data lives in, in deletion order.

use std::sync::Arc;

use tracing::info;

use um_config::{service_enabled, AppConfig};
use um_identity::UserDirectory;

use crate::batch::BatchDrainer;
use crate::client::DownstreamClient;
use crate::resource::{DeleteMode, ListShape, Ownership, Pagination, ResourceSource, ResourceSpec};
use crate::steps::{DeletionStep, IdentityStep, ResourceDrain, SingletonDelete};

pub const WAITING_ROOM_DEVICES: ResourceSpec = ResourceSpec {
    name: "waiting-room-devices",
    list_path: "devices",
    pagination: Pagination::Paged { show_hidden: true },
    shape: ListShape::Field("result"),
    id_field: "id",
    ownership: Ownership::Any,
    delete: DeleteMode::BatchBody { path: "devices" },
};

pub const DASHBOARDS: ResourceSpec = ResourceSpec {
    name: "dashboards",
    list_path: "dashboard",
    pagination: Pagination::Unpaged,
    shape: ListShape::Array,
    id_field: "id",
    ownership: Ownership::Any,
    delete: DeleteMode::EachById { path: "dashboard" },
};

pub const PROCESS_SCHEDULES: ResourceSpec = ResourceSpec {
    name: "process-schedules",
    list_path: "schedules",
    pagination: Pagination::Unpaged,
    shape: ListShape::Array,
    id_field: "id",
    ownership: Ownership::Any,
    delete: DeleteMode::EachById { path: "schedules" },
};

pub const IMPORTS: ResourceSpec = ResourceSpec {
    name: "imports",
    list_path: "instances",
    pagination: Pagination::Paged { show_hidden: false },
    shape: ListShape::Array,
    id_field: "id",
    ownership: Ownership::Any,
    delete: DeleteMode::EachById { path: "instances" },
};

pub const BROKER_EXPORTS: ResourceSpec = ResourceSpec {
    name: "broker-exports",
    list_path: "instances",
    pagination: Pagination::Paged { show_hidden: false },
    shape: ListShape::Field("instances"),
    id_field: "ID",
    ownership: Ownership::Any,
    delete: DeleteMode::EachById { path: "instances" },
};

pub const DATABASE_EXPORTS: ResourceSpec = ResourceSpec {
    name: "database-exports",
    list_path: "instance",
    pagination: Pagination::Paged { show_hidden: false },
    shape: ListShape::Field("instances"),
    id_field: "ID",
    ownership: Ownership::Any,
    delete: DeleteMode::BatchBody { path: "instances" },
};

pub const EXPORT_DATABASES: ResourceSpec = ResourceSpec {
    name: "export-databases",
    list_path: "databases",
    pagination: Pagination::Paged { show_hidden: false },
    shape: ListShape::Array,
    id_field: "ID",
    ownership: Ownership::KeepPublicOfOthers {
        public_field: "Public",
        owner_field: "UserId",
    },
    delete: DeleteMode::EachById { path: "databases" },
};

pub const ANALYTICS_OPERATORS: ResourceSpec = ResourceSpec {
    name: "analytics-operators",
    list_path: "operator",
    pagination: Pagination::All,
    shape: ListShape::Field("operators"),
    id_field: "_id",
    ownership: Ownership::OwnedBySubject {
        owner_field: "userId",
    },
    delete: DeleteMode::BatchBody { path: "operator" },
};

pub const ANALYTICS_FLOWS: ResourceSpec = ResourceSpec {
    name: "analytics-flows",
    list_path: "flow",
    pagination: Pagination::All,
    shape: ListShape::Field("flows"),
    id_field: "_id",
    ownership: Ownership::OwnedBySubject {
        owner_field: "userId",
    },
    delete: DeleteMode::EachById { path: "flow" },
};

pub const NOTIFICATIONS: ResourceSpec = ResourceSpec {
    name: "notifications",
    list_path: "notifications",
    pagination: Pagination::All,
    shape: ListShape::Field("notifications"),
    id_field: "_id",
    ownership: Ownership::Any,
    delete: DeleteMode::BatchBody {
        path: "notifications",
    },
};

pub const NOTIFICATION_BROKERS: ResourceSpec = ResourceSpec {
    name: "notification-brokers",
    list_path: "brokers",
    pagination: Pagination::All,
    shape: ListShape::Field("brokers"),
    id_field: "id",
    ownership: Ownership::Any,
    delete: DeleteMode::BatchBody { path: "brokers" },
};

pub const PLATFORM_BROKER: &str = "platform-broker";
pub const DEVICE_REPOSITORY: &str = "device-repository";
pub const IDENTITY: &str = "identity";

/// Builds the ordered step list from configuration.
pub struct PipelineBuilder {
    client: DownstreamClient,
    drainer: BatchDrainer,
    steps: Vec<DeletionStep>,
}

impl PipelineBuilder {
    pub fn new(client: DownstreamClient, drainer: BatchDrainer) -> Self {
        Self {
            client,
            drainer,
            steps: Vec::new(),
        }
    }

    /// Adds a resource step unless `base_url` disables it.
    pub fn resource(mut self, spec: ResourceSpec, base_url: &str) -> Self {
        if Self::enabled(spec.name, base_url) {
            let source = ResourceSource::new(spec, base_url, self.client.clone());
            self.steps
                .push(DeletionStep::new(spec.name, ResourceDrain::new(source, self.drainer)));
        }
        self
    }

    pub fn singleton(mut self, name: &str, base_url: &str, path: &str) -> Self {
        if Self::enabled(name, base_url) {
            let url = format!("{}/{}", base_url.trim_end_matches('/'), path);
            self.steps
                .push(DeletionStep::new(name, SingletonDelete::fixed(url, self.client.clone())));
        }
        self
    }

    /// DELETE `{base_url}/{path}/{user id}`.
    pub fn per_user(mut self, name: &str, base_url: &str, path: &str) -> Self {
        if Self::enabled(name, base_url) {
            let prefix = format!("{}/{}", base_url.trim_end_matches('/'), path);
            self.steps.push(DeletionStep::new(
                name,
                SingletonDelete::for_subject(prefix, self.client.clone()),
            ));
        }
        self
    }

    pub fn step(mut self, step: DeletionStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends the identity step, which always runs last.
    pub fn build(mut self, directory: Arc<dyn UserDirectory>) -> Vec<DeletionStep> {
        self.steps
            .push(DeletionStep::new(IDENTITY, IdentityStep::new(directory)));
        self.steps
    }

    fn enabled(name: &str, base_url: &str) -> bool {
        let enabled = service_enabled(base_url);
        if !enabled {
            info!(step = name, "Step disabled, no service URL configured");
        }
        enabled
    }
}

/// The full deletion pipeline for this deployment.
pub fn standard_pipeline(
    config: &AppConfig,
    client: DownstreamClient,
    directory: Arc<dyn UserDirectory>,
) -> Vec<DeletionStep> {
    let services = &config.services;
    let drainer = BatchDrainer::new(config.cleanup.batch_size, config.cleanup.loop_limit);

    let mut builder = PipelineBuilder::new(client, drainer)
        .resource(WAITING_ROOM_DEVICES, &services.waiting_room_url)
        .resource(DASHBOARDS, &services.dashboard_url)
        .resource(PROCESS_SCHEDULES, &services.process_scheduler_url)
        .resource(IMPORTS, &services.imports_deployment_url)
        .resource(BROKER_EXPORTS, &services.broker_exports_url)
        .resource(DATABASE_EXPORTS, &services.database_exports_url);

    if config.cleanup.remove_export_database_metadata {
        builder = builder.resource(EXPORT_DATABASES, &services.database_exports_url);
    }

    builder
        .resource(ANALYTICS_OPERATORS, &services.analytics_operator_repo_url)
        .resource(ANALYTICS_FLOWS, &services.analytics_flow_repo_url)
        .resource(NOTIFICATIONS, &services.notifier_url)
        .resource(NOTIFICATION_BROKERS, &services.notifier_url)
        .singleton(PLATFORM_BROKER, &services.notifier_url, "platform-broker")
        .per_user(DEVICE_REPOSITORY, &services.device_repository_url, "users")
        .build(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use um_identity::{DeleteOutcome, KeycloakUser};

    struct NoDirectory;

    #[async_trait]
    impl UserDirectory for NoDirectory {
        async fn get_user(&self, _user_id: &str) -> um_identity::Result<KeycloakUser> {
            Err(um_identity::IdentityError::UserNotFound(String::new()))
        }

        async fn delete_user(&self, _user_id: &str) -> um_identity::Result<DeleteOutcome> {
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }

    fn names(config: &AppConfig) -> Vec<String> {
        let client = DownstreamClient::with_client(reqwest::Client::new(), 1, Duration::ZERO);
        standard_pipeline(config, client, Arc::new(NoDirectory))
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn all_services() -> AppConfig {
        let mut config = AppConfig::default();
        let s = &mut config.services;
        s.waiting_room_url = "http://waiting-room".into();
        s.dashboard_url = "http://dashboard".into();
        s.process_scheduler_url = "http://scheduler".into();
        s.imports_deployment_url = "http://imports".into();
        s.broker_exports_url = "http://broker-exports".into();
        s.database_exports_url = "http://database-exports".into();
        s.analytics_operator_repo_url = "http://operators".into();
        s.analytics_flow_repo_url = "http://flows".into();
        s.notifier_url = "http://notifier".into();
        s.device_repository_url = "http://devices".into();
        config
    }

    #[test]
    fn test_full_pipeline_order() {
        let mut config = all_services();
        config.cleanup.remove_export_database_metadata = true;

        assert_eq!(
            names(&config),
            vec![
                "waiting-room-devices",
                "dashboards",
                "process-schedules",
                "imports",
                "broker-exports",
                "database-exports",
                "export-databases",
                "analytics-operators",
                "analytics-flows",
                "notifications",
                "notification-brokers",
                "platform-broker",
                "device-repository",
                "identity",
            ]
        );
    }

    #[test]
    fn test_disabled_services_are_skipped() {
        let mut config = all_services();
        config.services.dashboard_url = "-".into();
        config.services.notifier_url = String::new();

        let names = names(&config);
        assert!(!names.contains(&"dashboards".to_string()));
        assert!(!names.contains(&"export-databases".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("notification")));
        assert!(!names.contains(&"platform-broker".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("identity"));
    }

    #[test]
    fn test_nothing_configured_leaves_identity() {
        assert_eq!(names(&AppConfig::default()), vec!["identity"]);
    }
}
