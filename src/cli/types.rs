use clap::Args as ClapArgs;

use crate::product::{ProductInput, ProductUpdate};

#[derive(ClapArgs, Debug, Clone)]
pub struct ProductArgs {
    /// Product name
    #[clap(short, long)]
    pub name: String,

    /// Brand name
    #[clap(short, long)]
    pub brand: String,

    /// Comma separated ingredient list
    #[clap(short, long)]
    pub ingredients: String,

    /// Product categories
    #[clap(short, long, default_value = "")]
    pub categories: String,

    /// Manufacturer name
    #[clap(short, long, default_value = "")]
    pub manufacturer: String,

    /// Manufacturer part or catalog number
    #[clap(long, default_value = "")]
    pub manufacturer_number: String,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ProductUpdateArgs {
    /// New product name
    #[clap(short, long)]
    pub name: Option<String>,

    /// New brand name
    #[clap(short, long)]
    pub brand: Option<String>,

    /// New ingredient list
    #[clap(short, long)]
    pub ingredients: Option<String>,

    /// New categories
    #[clap(short, long)]
    pub categories: Option<String>,

    /// New manufacturer
    #[clap(short, long)]
    pub manufacturer: Option<String>,

    /// New manufacturer number
    #[clap(long)]
    pub manufacturer_number: Option<String>,
}

impl From<ProductArgs> for ProductInput {
    fn from(args: ProductArgs) -> Self {
        ProductInput {
            name: args.name,
            brand: args.brand,
            categories: args.categories,
            ingredients: args.ingredients,
            manufacturer: args.manufacturer,
            manufacturer_number: args.manufacturer_number,
        }
    }
}

impl From<ProductUpdateArgs> for ProductUpdate {
    fn from(args: ProductUpdateArgs) -> Self {
        ProductUpdate {
            name: args.name,
            brand: args.brand,
            categories: args.categories,
            ingredients: args.ingredients,
            manufacturer: args.manufacturer,
            manufacturer_number: args.manufacturer_number,
        }
    }
}
