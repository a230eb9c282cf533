use std::{process, sync::Arc};

use blendstore::{
    Connection, FieldValue,
    application::error::AppError,
    application::store::StoreControl,
    cache::{KeySpace, MemoryKv},
    config::{self, Command, EntitySettings, GetArgs, KeysArgs, Settings, WarmArgs},
    infra::{db::PostgresRepositories, error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(error) => {
            report_application_error(&error);
            process::exit(1);
        }
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "command failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "command failed");
    });
}

/// Returns whether the command succeeded.
async fn run() -> Result<bool, AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Check => Ok(run_check(&settings)),
        Command::Keys(args) => run_keys(&settings, args).map(|()| true),
        Command::Warm(args) => run_warm(&settings, args).await.map(|()| true),
        Command::Get(args) => run_get(&settings, args).await.map(|()| true),
    }
}

fn run_check(settings: &Settings) -> bool {
    if settings.entities.is_empty() {
        warn!("no entities are declared");
        return true;
    }

    let mut healthy = true;
    for entity in &settings.entities {
        match entity.descriptor() {
            Ok(descriptor) => println!("ok    {}", descriptor.name()),
            Err(err) => {
                healthy = false;
                println!("FAIL  {}: {err}", entity.name);
            }
        }
    }
    healthy
}

fn run_keys(settings: &Settings, args: KeysArgs) -> Result<(), AppError> {
    let descriptor = declared(settings, &args.entity)?.descriptor()?;
    let keys = KeySpace::new(descriptor.name());

    println!("primary    {}", keys.primary_raw(&args.key));
    println!("all-keys   {}", keys.all_keys());
    if let (Some(field), Some(value)) = (args.field.as_deref(), args.value.as_deref()) {
        let kind = if descriptor.is_index_field(field) {
            "unique"
        } else if descriptor.is_multi_index_field(field) {
            "multi"
        } else {
            warn!(entity = %descriptor.name(), field, "field is not indexed");
            "none"
        };
        println!("index      {} ({kind})", keys.index_raw(field, value));
    }
    Ok(())
}

async fn run_warm(settings: &Settings, args: WarmArgs) -> Result<(), AppError> {
    let store = open_store(settings, &args.entity).await?;
    let records = store.all().await?;
    info!(entity = %args.entity, records = records.len(), "entity warmed");
    println!("{} {} record(s) cached", args.entity, records.len());
    Ok(())
}

async fn run_get(settings: &Settings, args: GetArgs) -> Result<(), AppError> {
    let store = open_store(settings, &args.entity).await?;
    let record = match (args.key, args.field, args.value) {
        (Some(key), _, _) => store.get_or_fail(&FieldValue::Text(key)).await?,
        (None, Some(field), Some(value)) => {
            store
                .get_by_index_or_fail(&field, &FieldValue::Text(value))
                .await?
        }
        _ => return Err(AppError::unexpected("either --key or --field/--value is required")),
    };
    let json = serde_json::to_string_pretty(&record)
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{json}");
    Ok(())
}

fn declared<'a>(settings: &'a Settings, name: &str) -> Result<&'a EntitySettings, AppError> {
    settings
        .entity(name)
        .ok_or_else(|| AppError::UnknownEntity(name.to_string()))
}

async fn open_store(settings: &Settings, name: &str) -> Result<StoreControl, AppError> {
    let descriptor = declared(settings, name)?.descriptor()?;
    let connection = Connection::open(Arc::new(MemoryKv::new()), init_repositories(settings).await?)
        .with_retry_policy(settings.writes.retry_policy())
        .on_write_failure(|failure| {
            error!(
                entity = %failure.entity,
                op = failure.operation,
                attempts = failure.attempts,
                error = %failure.error,
                "write-back lost"
            );
        });
    Ok(connection.store_control(descriptor)?)
}

async fn init_repositories(settings: &Settings) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    let repositories = PostgresRepositories::new(pool);
    repositories
        .health_check()
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    Ok(Arc::new(repositories))
}
