use scanstate_api::{EntityKey, Page, StateStore};
use scanstate_engine::open_store;

use crate::config::{InspectArgs, InspectCommand};
use crate::error::ServerError;

pub async fn run(args: InspectArgs) -> Result<(), ServerError> {
    let config = args.common.resolve()?;
    let store = open_store(&config.store).await?;

    let output = query_then_close(&*store, &args.command).await?;
    println!("{output}");
    Ok(())
}

async fn query_then_close(store: &dyn StateStore, command: &InspectCommand) -> Result<String, ServerError> {
    let output = query(store, command).await;
    super::close_store(store).await;
    output
}

async fn query(store: &dyn StateStore, command: &InspectCommand) -> Result<String, ServerError> {
    let json = match command {
        InspectCommand::List { limit, offset } => {
            let records = store.list(Page::new(*limit, *offset)).await?;
            serde_json::to_string_pretty(&records)?
        }
        InspectCommand::Get { ip, port, service } => {
            let key = EntityKey::new(ip, *port, service);
            match store.get(&key).await? {
                Some(record) => serde_json::to_string_pretty(&record)?,
                None => return Err(ServerError::NotFound(key.to_string())),
            }
        }
    };
    Ok(json)
}
