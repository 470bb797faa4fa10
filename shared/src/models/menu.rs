//! Menu models (reference data)

use serde::{Deserialize, Serialize};

/// Menu category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuCategory {
    pub id: String,
    pub name: String,
    pub display_order: i32,
    pub is_active: bool,
}

/// Menu item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    pub category_id: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub is_available: bool,
    #[serde(default)]
    pub is_vegetarian: bool,
    #[serde(default)]
    pub is_vegan: bool,
    #[serde(default)]
    pub allergens: Option<Vec<String>>,
    #[serde(default)]
    pub prep_time_minutes: i32,
    #[serde(default)]
    pub display_order: i32,
}

impl MenuItem {
    /// Vegan items count as vegetarian
    pub fn is_vegetarian_friendly(&self) -> bool {
        self.is_vegetarian || self.is_vegan
    }
}

/// Row of the `menu_with_categories` view: item joined with its category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItemWithCategory {
    #[serde(flatten)]
    pub item: MenuItem,
    pub category_name: String,
    pub category_order: i32,
}

/// A category with its items, as the menu screen renders it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuSection {
    pub category: MenuCategory,
    pub items: Vec<MenuItem>,
}
