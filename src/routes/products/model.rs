use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 创建与整体更新共用的请求体
#[derive(Debug, Deserialize)]
pub struct ProductRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i64,
}

impl ProductRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        let name_len = self.name.chars().count();
        if name_len == 0 || name_len > 255 {
            return Err(AppError::Validation("商品名称长度需在1到255之间".to_string()));
        }
        if self
            .description
            .as_ref()
            .is_some_and(|d| d.chars().count() > 1000)
        {
            return Err(AppError::Validation("商品描述不能超过1000个字符".to_string()));
        }
        if !(self.price.is_finite() && self.price > 0.0) {
            return Err(AppError::Validation("商品价格必须大于0".to_string()));
        }
        if self.stock < 0 {
            return Err(AppError::Validation("库存不能为负数".to_string()));
        }
        Ok(())
    }

    pub fn into_product(self, id: i64, now: DateTime<Utc>) -> Product {
        Product {
            id,
            name: self.name,
            description: self.description,
            price: self.price,
            stock: self.stock,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_to(self, product: &mut Product, now: DateTime<Utc>) {
        product.name = self.name;
        product.description = self.description;
        product.price = self.price;
        product.stock = self.stock;
        product.updated_at = now;
    }
}
