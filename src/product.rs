use serde::{Deserialize, Serialize};

use crate::config::ValidationConfig;
use crate::corpus::{build_corpus, content_hash, normalize_text, CorpusFields};
use crate::errors::CatalogError;

/// A catalog row. Column names match the persisted metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: u64,
    pub name: String,
    pub brand: String,
    #[serde(default)]
    pub categories: String,
    #[serde(default)]
    pub ingredients: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(rename = "manufacturerNumber", default)]
    pub manufacturer_number: String,
    #[serde(rename = "text_corpus", default)]
    pub corpus: String,
}

/// Fields accepted by `add`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInput {
    pub name: String,
    pub brand: String,
    #[serde(default)]
    pub categories: String,
    pub ingredients: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub manufacturer_number: String,
}

/// Partial field set accepted by `update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub categories: Option<String>,
    pub ingredients: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_number: Option<String>,
}

/// One normalized row from the ingestion pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedRow {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub categories: String,
    #[serde(default)]
    pub ingredients: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(rename = "manufacturerNumber", default)]
    pub manufacturer_number: String,
}

/// Record view returned to callers of `search`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    pub id: u64,
    pub name: String,
    pub brand: String,
    pub ingredients: String,
    pub categories: String,
    pub manufacturer: String,
    pub manufacturer_number: String,
}

impl ProductRecord {
    /// Create a record from user input. Fields are normalized and the corpus
    /// derived from them.
    pub fn from_input(id: u64, input: &ProductInput) -> Self {
        let mut record = Self {
            id,
            name: normalize_text(&input.name),
            brand: normalize_text(&input.brand),
            categories: normalize_text(&input.categories),
            ingredients: normalize_text(&input.ingredients),
            manufacturer: normalize_text(&input.manufacturer),
            manufacturer_number: normalize_text(&input.manufacturer_number),
            corpus: String::new(),
        };
        record.corpus = build_corpus(&record.corpus_fields());
        record
    }

    pub fn corpus_fields(&self) -> CorpusFields<'_> {
        CorpusFields {
            name: &self.name,
            brand: &self.brand,
            categories: &self.categories,
            ingredients: &self.ingredients,
            manufacturer: &self.manufacturer,
            manufacturer_number: &self.manufacturer_number,
        }
    }

    /// Return a copy with the update applied and the corpus recomputed.
    pub fn with_update(&self, update: &ProductUpdate) -> Self {
        let pick = |new: &Option<String>, old: &str| match new {
            Some(value) => normalize_text(value),
            None => old.to_string(),
        };

        let mut record = Self {
            id: self.id,
            name: pick(&update.name, &self.name),
            brand: pick(&update.brand, &self.brand),
            categories: pick(&update.categories, &self.categories),
            ingredients: pick(&update.ingredients, &self.ingredients),
            manufacturer: pick(&update.manufacturer, &self.manufacturer),
            manufacturer_number: pick(&update.manufacturer_number, &self.manufacturer_number),
            corpus: String::new(),
        };
        record.corpus = build_corpus(&record.corpus_fields());
        record
    }

    /// Whether the stored corpus still matches the fields it was built from.
    pub fn corpus_is_current(&self) -> bool {
        self.corpus == build_corpus(&self.corpus_fields())
    }

    /// Hash of the stored corpus, kept beside the vector to detect drift.
    pub fn content_hash(&self) -> u64 {
        content_hash(&self.corpus)
    }

    pub fn view(&self) -> ProductView {
        ProductView {
            id: self.id,
            name: self.name.clone(),
            brand: self.brand.clone(),
            ingredients: self.ingredients.clone(),
            categories: self.categories.clone(),
            manufacturer: self.manufacturer.clone(),
            manufacturer_number: self.manufacturer_number.clone(),
        }
    }
}

impl ProductUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.brand.is_none()
            && self.categories.is_none()
            && self.ingredients.is_none()
            && self.manufacturer.is_none()
            && self.manufacturer_number.is_none()
    }
}

impl SeedRow {
    pub fn into_input(self) -> (Option<u64>, ProductInput) {
        (
            self.id,
            ProductInput {
                name: self.name,
                brand: self.brand,
                categories: self.categories,
                ingredients: self.ingredients,
                manufacturer: self.manufacturer,
                manufacturer_number: self.manufacturer_number,
            },
        )
    }
}

fn check_required(errors: &mut Vec<String>, field: &str, value: &str) {
    if normalize_text(value).is_empty() {
        errors.push(format!("{field} is required"));
    }
}

fn check_length(errors: &mut Vec<String>, field: &str, value: &str, max: usize) {
    let len = value.trim().chars().count();
    if len > max {
        errors.push(format!("{field} must be {max} characters or less (got {len})"));
    }
}

/// Validate fields for a new product.
pub fn validate_input(input: &ProductInput, limits: &ValidationConfig) -> Result<(), CatalogError> {
    let mut errors = Vec::new();

    check_required(&mut errors, "name", &input.name);
    check_required(&mut errors, "brand", &input.brand);
    check_required(&mut errors, "ingredients", &input.ingredients);

    check_length(&mut errors, "name", &input.name, limits.max_name_length);
    check_length(&mut errors, "brand", &input.brand, limits.max_brand_length);
    check_length(&mut errors, "ingredients", &input.ingredients, limits.max_ingredients_length);
    check_length(&mut errors, "categories", &input.categories, limits.max_text_length);
    check_length(&mut errors, "manufacturer", &input.manufacturer, limits.max_text_length);
    check_length(
        &mut errors,
        "manufacturerNumber",
        &input.manufacturer_number,
        limits.max_text_length,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CatalogError::Validation { errors })
    }
}

/// Validate a partial update. Only supplied fields are checked; required
/// fields may not be blanked.
pub fn validate_update(update: &ProductUpdate, limits: &ValidationConfig) -> Result<(), CatalogError> {
    if update.is_empty() {
        return Err(CatalogError::validation("no fields to update"));
    }

    let mut errors = Vec::new();

    if let Some(name) = &update.name {
        check_required(&mut errors, "name", name);
        check_length(&mut errors, "name", name, limits.max_name_length);
    }
    if let Some(brand) = &update.brand {
        check_required(&mut errors, "brand", brand);
        check_length(&mut errors, "brand", brand, limits.max_brand_length);
    }
    if let Some(ingredients) = &update.ingredients {
        check_required(&mut errors, "ingredients", ingredients);
        check_length(&mut errors, "ingredients", ingredients, limits.max_ingredients_length);
    }
    for (field, value) in [
        ("categories", &update.categories),
        ("manufacturer", &update.manufacturer),
        ("manufacturerNumber", &update.manufacturer_number),
    ] {
        if let Some(value) = value {
            check_length(&mut errors, field, value, limits.max_text_length);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CatalogError::Validation { errors })
    }
}
