//! Menu reads (reference data, long staleness window)

use crate::backend::{Backend, Filter, Query, decode_rows};
use crate::cache::{QueryCache, QueryKey};
use crate::error::ClientResult;
use serde_json::Value;
use shared::message::Table;
use shared::models::{MenuCategory, MenuItem, MenuItemWithCategory, MenuSection};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MenuService {
    backend: Arc<dyn Backend>,
    cache: Arc<QueryCache>,
    stale_time: Duration,
}

impl MenuService {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<QueryCache>, stale_time: Duration) -> Self {
        Self {
            backend,
            cache,
            stale_time,
        }
    }

    /// Active categories by display order
    pub async fn categories(&self) -> ClientResult<Vec<MenuCategory>> {
        let query = Query::new().eq("is_active", true).order("display_order", true);
        self.cached(QueryKey::MenuCategories, Table::MenuCategories, query).await
    }

    /// Every item with its category, in menu order
    pub async fn items(&self) -> ClientResult<Vec<MenuItemWithCategory>> {
        self.cached(QueryKey::MenuItems, Table::MenuWithCategories, menu_order(Query::new()))
            .await
    }

    /// Available items of one category
    pub async fn items_by_category(&self, category_id: &str) -> ClientResult<Vec<MenuItem>> {
        if category_id.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::new()
            .eq("category_id", category_id)
            .eq("is_available", true)
            .order("display_order", true);
        let key = QueryKey::MenuItemsByCategory {
            category_id: category_id.to_string(),
        };
        self.cached(key, Table::MenuItems, query).await
    }

    /// Available items whose name or description contains `text`, ignoring case
    pub async fn search(&self, text: &str) -> ClientResult<Vec<MenuItemWithCategory>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let query = menu_order(
            Query::new()
                .or(vec![
                    Filter::ilike_contains("name", text),
                    Filter::ilike_contains("description", text),
                ])
                .eq("is_available", true),
        );
        let key = QueryKey::MenuSearch {
            query: text.to_lowercase(),
        };
        self.cached(key, Table::MenuWithCategories, query).await
    }

    /// Available vegetarian or vegan items
    pub async fn vegetarian_items(&self) -> ClientResult<Vec<MenuItemWithCategory>> {
        let query = menu_order(
            Query::new()
                .eq("is_available", true)
                .or(vec![
                    Filter::Eq("is_vegetarian".into(), Value::Bool(true)),
                    Filter::Eq("is_vegan".into(), Value::Bool(true)),
                ]),
        );
        self.cached(QueryKey::VegetarianItems, Table::MenuWithCategories, query)
            .await
    }

    /// Items grouped under their categories; categories keep display order
    pub async fn menu_by_category(&self) -> ClientResult<Vec<MenuSection>> {
        let (categories, items) = futures::try_join!(self.categories(), self.items())?;
        Ok(group_by_category(categories, items))
    }

    async fn cached<T>(&self, key: QueryKey, table: Table, query: Query) -> ClientResult<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let backend = self.backend.clone();
        self.cache
            .fetch(key, self.stale_time, || async move {
                let rows = backend.select(table, &query).await?;
                tracing::debug!(table = %table, count = rows.len(), "Fetched menu rows");
                decode_rows(rows)
            })
            .await
    }
}

fn menu_order(query: Query) -> Query {
    query.order("category_order", true).order("display_order", true)
}

/// Attach items to their category, in the order the items arrive
pub fn group_by_category(categories: Vec<MenuCategory>, items: Vec<MenuItemWithCategory>) -> Vec<MenuSection> {
    categories
        .into_iter()
        .map(|category| {
            let items = items
                .iter()
                .filter(|i| i.item.category_id == category.id)
                .map(|i| i.item.clone())
                .collect();
            MenuSection { category, items }
        })
        .collect()
}
