//! saffron-monitor: headless kitchen monitor
//!
//! Usage:
//!   saffron-monitor <email> <password> <Cardiff|Wembley>   hosted backend from env
//!   saffron-monitor --demo                                  in-memory backend

use anyhow::{Context, bail};
use saffron_client::logger::init_logger;
use saffron_client::{
    AppState, Backend, BranchName, Cart, ClientConfig, DeviceInfo, MemoryBackend, OrderStatus, Platform,
    SupabaseBackend,
};
use serde_json::json;
use shared::message::Table;
use std::sync::Arc;

const DEMO_EMAIL: &str = "kitchen@saffron.demo";
const DEMO_PASSWORD: &str = "demo";

fn print_banner() {
    println!("🍛 saffron-monitor {}", env!("CARGO_PKG_VERSION"));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    init_logger(&config.log_level, config.log_json)?;
    print_banner();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [flag] if flag == "--demo" => run_demo(config).await,
        [email, password, branch] => {
            let branch: BranchName = branch.parse()?;
            run_hosted(config, email, password, branch).await
        }
        _ => bail!("usage: saffron-monitor <email> <password> <Cardiff|Wembley> | --demo"),
    }
}

async fn run_hosted(config: ClientConfig, email: &str, password: &str, branch: BranchName) -> anyhow::Result<()> {
    let backend: Arc<dyn Backend> = Arc::new(SupabaseBackend::new(&config)?);
    let app = Arc::new(AppState::new(config, backend, Platform::headless(DeviceInfo::from_host())));
    app.start().await?;

    let profile = app
        .sign_in(email, password, branch)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    tracing::info!(
        user = %profile.branch_user.display_name(),
        branch = %profile.branch.name,
        "Monitoring orders"
    );

    for summary in app.orders().list_orders(None).await? {
        tracing::info!(
            order_number = %summary.order.order_number,
            table = %summary.order.table_number,
            status = %summary.order.status,
            items = summary.item_count,
            "Open order"
        );
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    app.sign_out().await;
    app.shutdown().await;
    Ok(())
}

async fn run_demo(config: ClientConfig) -> anyhow::Result<()> {
    let memory = Arc::new(MemoryBackend::new());
    seed_demo(&memory)?;

    let app = Arc::new(AppState::new(
        config,
        memory.clone(),
        Platform::headless(DeviceInfo::new(Some("demo-till".into()), None)),
    ));
    app.start().await?;
    app.sign_in(DEMO_EMAIL, DEMO_PASSWORD, BranchName::Cardiff).await?;

    let mut cart = Cart::new();
    for section in app.menu().menu_by_category().await? {
        if let Some(item) = section.items.first() {
            cart.add(item.clone());
        }
    }
    let order = app.orders().create_order(cart.to_order_request("12", None)).await?;
    tracing::info!(order_number = %order.order_number, total = order.total_amount, "Demo order placed");

    for status in [OrderStatus::Preparing, OrderStatus::Ready] {
        let order = app.orders().update_order_status(&order.id, status).await?;
        tracing::info!(status = %order.status, ready_at = ?order.ready_at, "Demo order moved");
    }

    let stats = app.orders().order_stats().await?;
    let unread = app.notifications().unread_count().await?;
    tracing::info!(total = stats.total, ready = stats.ready, unread = unread, "Demo finished");

    app.sign_out().await;
    app.shutdown().await;
    Ok(())
}

fn seed_demo(memory: &MemoryBackend) -> anyhow::Result<()> {
    memory.seed(Table::Branches, vec![json!({"id": "branch-cardiff", "name": "Cardiff"})])?;
    let user = memory.add_user(DEMO_EMAIL, DEMO_PASSWORD, "user-kitchen");
    memory.seed(
        Table::BranchUsers,
        vec![json!({
            "id": user.id,
            "branch_id": "branch-cardiff",
            "full_name": "Kitchen",
            "role": "staff",
            "is_active": true
        })],
    )?;
    memory.seed(
        Table::MenuCategories,
        vec![
            json!({"id": "cat-starters", "name": "Starters", "display_order": 1, "is_active": true}),
            json!({"id": "cat-mains", "name": "Mains", "display_order": 2, "is_active": true}),
        ],
    )?;
    memory.seed(
        Table::MenuItems,
        vec![
            json!({"id": "item-bhaji", "name": "Onion Bhaji", "price": 4.95, "category_id": "cat-starters",
                   "is_available": true, "is_vegetarian": true, "display_order": 1}),
            json!({"id": "item-korma", "name": "Chicken Korma", "price": 11.5, "category_id": "cat-mains",
                   "is_available": true, "display_order": 1}),
        ],
    )?;
    Ok(())
}
