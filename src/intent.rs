//! Mutation intents: the typed description of one write waiting to be replayed
//! against the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ValidationError;

/// Locally unique id assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(pub i64);

impl std::fmt::Display for IntentId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.0, f)
  }
}

text_enum! {
  /// Business entity a mutation targets.
  pub enum Category as "category" {
    Order => "order",
    Cart => "cart",
    Favorite => "favorite",
    Review => "review",
    Contact => "contact",
  }
}

text_enum! {
  pub enum Action as "action" {
    Create => "create",
    Update => "update",
    Delete => "delete",
  }
}

text_enum! {
  /// HTTP method used to replay the mutation.
  pub enum Method as "method" {
    Post => "POST",
    Put => "PUT",
    Patch => "PATCH",
    Delete => "DELETE",
  }
}

text_enum! {
  /// Lifecycle state of a queued intent.
  pub enum Status as "status" {
    /// Waiting for its first attempt
    Pending => "pending",
    /// An attempt is in flight
    Syncing => "syncing",
    /// Delivered; rows in this state are removed immediately
    Success => "success",
    /// Last attempt failed, will be retried by the next pass
    Error => "error",
  }
}

// ============================================================================
// Payload schemas
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
  pub product_id: String,
  pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBody {
  pub items: Vec<LineItem>,
  pub shipping_address: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
}

/// Cart line change. On update a quantity of 0 removes the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartBody {
  pub product_id: String,
  pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteBody {
  pub product_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewBody {
  pub product_id: String,
  pub rating: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactBody {
  pub name: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subject: Option<String>,
  pub message: String,
}

/// Typed mutation body, tagged by category.
///
/// The body is optional so that deletes can be queued without a payload;
/// `NewIntent::validate` enforces when one is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "body", rename_all = "lowercase")]
pub enum Mutation {
  Order(Option<OrderBody>),
  Cart(Option<CartBody>),
  Favorite(Option<FavoriteBody>),
  Review(Option<ReviewBody>),
  Contact(Option<ContactBody>),
}

impl Mutation {
  /// A mutation of the given category with no body.
  pub fn empty(category: Category) -> Self {
    match category {
      Category::Order => Mutation::Order(None),
      Category::Cart => Mutation::Cart(None),
      Category::Favorite => Mutation::Favorite(None),
      Category::Review => Mutation::Review(None),
      Category::Contact => Mutation::Contact(None),
    }
  }

  /// Rebuild a typed mutation from its category and raw JSON body.
  pub fn from_parts(category: Category, body: Option<Value>) -> Result<Self, ValidationError> {
    let body = match body {
      None | Some(Value::Null) => return Ok(Self::empty(category)),
      Some(body) => body,
    };

    let schema_err = |e: serde_json::Error| ValidationError::Schema {
      category,
      reason: e.to_string(),
    };

    Ok(match category {
      Category::Order => Mutation::Order(Some(serde_json::from_value(body).map_err(schema_err)?)),
      Category::Cart => Mutation::Cart(Some(serde_json::from_value(body).map_err(schema_err)?)),
      Category::Favorite => {
        Mutation::Favorite(Some(serde_json::from_value(body).map_err(schema_err)?))
      }
      Category::Review => Mutation::Review(Some(serde_json::from_value(body).map_err(schema_err)?)),
      Category::Contact => {
        Mutation::Contact(Some(serde_json::from_value(body).map_err(schema_err)?))
      }
    })
  }

  pub fn category(&self) -> Category {
    match self {
      Mutation::Order(_) => Category::Order,
      Mutation::Cart(_) => Category::Cart,
      Mutation::Favorite(_) => Category::Favorite,
      Mutation::Review(_) => Category::Review,
      Mutation::Contact(_) => Category::Contact,
    }
  }

  pub fn has_body(&self) -> bool {
    match self {
      Mutation::Order(b) => b.is_some(),
      Mutation::Cart(b) => b.is_some(),
      Mutation::Favorite(b) => b.is_some(),
      Mutation::Review(b) => b.is_some(),
      Mutation::Contact(b) => b.is_some(),
    }
  }

  /// The body as the JSON sent over the wire.
  pub fn body_json(&self) -> Result<Option<Value>, serde_json::Error> {
    match self {
      Mutation::Order(b) => b.as_ref().map(serde_json::to_value).transpose(),
      Mutation::Cart(b) => b.as_ref().map(serde_json::to_value).transpose(),
      Mutation::Favorite(b) => b.as_ref().map(serde_json::to_value).transpose(),
      Mutation::Review(b) => b.as_ref().map(serde_json::to_value).transpose(),
      Mutation::Contact(b) => b.as_ref().map(serde_json::to_value).transpose(),
    }
  }

  fn validate(&self, action: Action) -> Result<(), ValidationError> {
    let category = self.category();

    match (category, action) {
      (Category::Contact, Action::Update | Action::Delete)
      | (Category::Favorite, Action::Update) => {
        return Err(ValidationError::UnsupportedAction { category, action });
      }
      _ => {}
    }

    if !self.has_body() {
      return if action == Action::Delete {
        Ok(())
      } else {
        Err(ValidationError::MissingBody { category, action })
      };
    }

    match self {
      Mutation::Order(Some(order)) => {
        if order.items.is_empty() {
          return Err(field("items", "an order needs at least one line item"));
        }
        for item in &order.items {
          require_non_empty("product_id", &item.product_id)?;
          if item.quantity == 0 {
            return Err(field("quantity", "line item quantity must be positive"));
          }
        }
        require_non_empty("shipping_address", &order.shipping_address)
      }
      Mutation::Cart(Some(cart)) => {
        require_non_empty("product_id", &cart.product_id)?;
        if action == Action::Create && cart.quantity == 0 {
          return Err(field("quantity", "cannot add zero items to the cart"));
        }
        Ok(())
      }
      Mutation::Favorite(Some(favorite)) => require_non_empty("product_id", &favorite.product_id),
      Mutation::Review(Some(review)) => {
        require_non_empty("product_id", &review.product_id)?;
        if !(1..=5).contains(&review.rating) {
          return Err(field("rating", "rating must be between 1 and 5"));
        }
        Ok(())
      }
      Mutation::Contact(Some(contact)) => {
        require_non_empty("name", &contact.name)?;
        require_non_empty("message", &contact.message)?;
        match contact.email.split_once('@') {
          Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
          _ => Err(field("email", "not an email address")),
        }
      }
      _ => Ok(()),
    }
  }
}

fn field(field: &'static str, reason: &str) -> ValidationError {
  ValidationError::Field {
    field,
    reason: reason.to_string(),
  }
}

fn require_non_empty(name: &'static str, value: &str) -> Result<(), ValidationError> {
  if value.trim().is_empty() {
    Err(field(name, "must not be empty"))
  } else {
    Ok(())
  }
}

/// Accepts absolute http(s) URLs and paths starting with `/`.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
  let invalid = |reason: &str| ValidationError::InvalidEndpoint {
    endpoint: endpoint.to_string(),
    reason: reason.to_string(),
  };

  if endpoint.starts_with("//") {
    return Err(invalid("scheme-relative URLs are not supported"));
  }
  if endpoint.starts_with('/') {
    return Ok(());
  }

  let url = Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
  match url.scheme() {
    "http" | "https" if url.host().is_some() => Ok(()),
    "http" | "https" => Err(invalid("missing host")),
    _ => Err(invalid("only http and https endpoints can be replayed")),
  }
}

// ============================================================================
// Queue records
// ============================================================================

/// A mutation intent as submitted by the caller, before the store assigns an
/// id, timestamp and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIntent {
  pub mutation: Mutation,
  pub action: Action,
  pub method: Method,
  pub endpoint: String,
}

impl NewIntent {
  pub fn new(mutation: Mutation, action: Action, method: Method, endpoint: impl Into<String>) -> Self {
    Self {
      mutation,
      action,
      method,
      endpoint: endpoint.into(),
    }
  }

  /// `create` replayed as POST.
  pub fn create(mutation: Mutation, endpoint: impl Into<String>) -> Self {
    Self::new(mutation, Action::Create, Method::Post, endpoint)
  }

  /// `update` replayed as PUT.
  pub fn update(mutation: Mutation, endpoint: impl Into<String>) -> Self {
    Self::new(mutation, Action::Update, Method::Put, endpoint)
  }

  /// `delete` replayed as DELETE with no body.
  pub fn delete(category: Category, endpoint: impl Into<String>) -> Self {
    Self::new(Mutation::empty(category), Action::Delete, Method::Delete, endpoint)
  }

  pub fn category(&self) -> Category {
    self.mutation.category()
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    validate_endpoint(&self.endpoint)?;
    self.mutation.validate(self.action)
  }
}

/// A mutation intent as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedIntent {
  pub id: IntentId,
  pub category: Category,
  pub action: Action,
  pub endpoint: String,
  pub method: Method,
  pub payload: Option<Value>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub retry_count: u32,
  pub status: Status,
  pub last_error: Option<String>,
}

impl QueuedIntent {
  /// Typed view of the payload.
  pub fn mutation(&self) -> Result<Mutation, ValidationError> {
    Mutation::from_parts(self.category, self.payload.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn cart(product: &str, quantity: u32) -> Mutation {
    Mutation::Cart(Some(CartBody {
      product_id: product.to_string(),
      quantity,
    }))
  }

  #[test]
  fn test_create_requires_body() {
    let intent = NewIntent::create(Mutation::empty(Category::Order), "/api/orders");
    assert_eq!(
      intent.validate(),
      Err(ValidationError::MissingBody {
        category: Category::Order,
        action: Action::Create
      })
    );
  }

  #[test]
  fn test_delete_without_body_is_valid() {
    let intent = NewIntent::delete(Category::Favorite, "/api/favorites/p1");
    assert!(intent.validate().is_ok());
  }

  #[test]
  fn test_contact_is_create_only() {
    let intent = NewIntent::delete(Category::Contact, "/api/contact/1");
    assert!(matches!(
      intent.validate(),
      Err(ValidationError::UnsupportedAction { .. })
    ));
  }

  #[test]
  fn test_cart_update_allows_zero_quantity() {
    assert!(NewIntent::update(cart("p1", 0), "/api/cart").validate().is_ok());
    assert!(NewIntent::create(cart("p1", 0), "/api/cart").validate().is_err());
  }

  #[test]
  fn test_review_rating_range() {
    let review = |rating| {
      NewIntent::create(
        Mutation::Review(Some(ReviewBody {
          product_id: "p1".into(),
          rating,
          comment: None,
        })),
        "/api/reviews",
      )
    };
    assert!(review(5).validate().is_ok());
    assert!(matches!(
      review(6).validate(),
      Err(ValidationError::Field { field: "rating", .. })
    ));
  }

  #[test]
  fn test_contact_email() {
    let contact = |email: &str| {
      NewIntent::create(
        Mutation::Contact(Some(ContactBody {
          name: "Ada".into(),
          email: email.into(),
          subject: None,
          message: "Where is my parcel?".into(),
        })),
        "/api/contact",
      )
    };
    assert!(contact("ada@example.com").validate().is_ok());
    assert!(contact("ada@").validate().is_err());
    assert!(contact("ada").validate().is_err());
  }

  #[test]
  fn test_endpoint_validation() {
    assert!(validate_endpoint("/api/cart").is_ok());
    assert!(validate_endpoint("https://shop.example.com/api/cart").is_ok());
    assert!(validate_endpoint("ftp://shop.example.com/cart").is_err());
    assert!(validate_endpoint("//shop.example.com/cart").is_err());
    assert!(validate_endpoint("api/cart").is_err());
  }

  #[test]
  fn test_from_parts_checks_schema() {
    let ok = Mutation::from_parts(Category::Cart, Some(json!({"product_id": "p1", "quantity": 2})));
    assert_eq!(ok, Ok(cart("p1", 2)));

    let bad = Mutation::from_parts(Category::Cart, Some(json!({"sku": "p1"})));
    assert!(matches!(bad, Err(ValidationError::Schema { .. })));

    let empty = Mutation::from_parts(Category::Review, Some(Value::Null));
    assert_eq!(empty, Ok(Mutation::Review(None)));
  }

  #[test]
  fn test_text_enums_parse_case_insensitively() {
    assert_eq!("post".parse::<Method>(), Ok(Method::Post));
    assert_eq!("ORDER".parse::<Category>(), Ok(Category::Order));
    assert!("archived".parse::<Status>().is_err());
    assert_eq!(Method::Patch.to_string(), "PATCH");
  }
}
