//! In-memory cart used while building an order

use serde::{Deserialize, Serialize};
use shared::models::{CreateOrderRequest, MenuItem, NewOrderItem};
use shared::money;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub menu_item: MenuItem,
    pub quantity: i32,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

/// Cart lines in insertion order, one per menu item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    items: Vec<CartItem>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one of `menu_item`, or bump the quantity if already present
    pub fn add(&mut self, menu_item: MenuItem) {
        match self.items.iter_mut().find(|i| i.menu_item.id == menu_item.id) {
            Some(line) => line.quantity += 1,
            None => self.items.push(CartItem {
                menu_item,
                quantity: 1,
                special_instructions: None,
            }),
        }
    }

    pub fn remove(&mut self, menu_item_id: &str) {
        self.items.retain(|i| i.menu_item.id != menu_item_id);
    }

    /// Set a line's quantity; zero or less removes it
    pub fn set_quantity(&mut self, menu_item_id: &str, quantity: i32) {
        if quantity <= 0 {
            self.remove(menu_item_id);
            return;
        }
        if let Some(line) = self.items.iter_mut().find(|i| i.menu_item.id == menu_item_id) {
            line.quantity = quantity;
        }
    }

    pub fn set_instructions(&mut self, menu_item_id: &str, instructions: Option<String>) {
        if let Some(line) = self.items.iter_mut().find(|i| i.menu_item.id == menu_item_id) {
            line.special_instructions = instructions.filter(|s| !s.trim().is_empty());
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of quantities
    pub fn total_items(&self) -> i32 {
        self.items.iter().map(|i| i.quantity).sum()
    }

    pub fn total_price(&self) -> f64 {
        money::order_total(self.items.iter().map(|i| (i.quantity, i.menu_item.price)))
    }

    /// Create-order input priced at the menu prices captured when added
    pub fn to_order_request(&self, table_number: &str, notes: Option<&str>) -> CreateOrderRequest {
        CreateOrderRequest {
            table_number: table_number.trim().to_string(),
            items: self
                .items
                .iter()
                .map(|i| NewOrderItem {
                    menu_item_id: i.menu_item.id.clone(),
                    quantity: i.quantity,
                    unit_price: i.menu_item.price,
                    special_instructions: i.special_instructions.clone(),
                })
                .collect(),
            notes: notes.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn menu_item(id: &str, price: f64) -> MenuItem {
        MenuItem {
            id: id.into(),
            name: format!("Dish {id}"),
            description: String::new(),
            price,
            category_id: "c1".into(),
            image_url: None,
            is_available: true,
            is_vegetarian: false,
            is_vegan: false,
            allergens: None,
            prep_time_minutes: 10,
            display_order: 0,
        }
    }

    #[test]
    fn test_add_increments_existing_line() {
        let mut cart = Cart::new();
        cart.add(menu_item("a", 4.5));
        cart.add(menu_item("b", 2.0));
        cart.add(menu_item("a", 4.5));
        assert_eq!(cart.items().len(), 2);
        assert_eq!(cart.items()[0].quantity, 2);
        assert_eq!(cart.total_items(), 3);
        assert_eq!(cart.total_price(), 11.0);
    }

    #[test]
    fn test_set_quantity_zero_removes() {
        let mut cart = Cart::new();
        cart.add(menu_item("a", 1.0));
        cart.set_quantity("a", 5);
        assert_eq!(cart.total_items(), 5);
        cart.set_quantity("a", 0);
        assert!(cart.is_empty());
    }

    #[test]
    fn test_order_request_uses_captured_prices() {
        let mut cart = Cart::new();
        cart.add(menu_item("a", 5.0));
        cart.add(menu_item("a", 5.0));
        cart.set_instructions("a", Some("no chilli".into()));

        let request = cart.to_order_request(" 12 ", Some("  "));
        assert_eq!(request.table_number, "12");
        assert_eq!(request.notes, None);
        assert_eq!(request.items.len(), 1);
        assert_eq!(request.items[0].quantity, 2);
        assert_eq!(request.items[0].unit_price, 5.0);
        assert_eq!(request.items[0].special_instructions.as_deref(), Some("no chilli"));

        cart.clear();
        assert_eq!(cart.total_price(), 0.0);
    }
}
