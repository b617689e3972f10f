use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    /// Slice an already filtered and ordered listing.
    pub fn paginate<I>(iter: I, limit: Option<usize>, offset: Option<usize>) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let offset = offset.unwrap_or(0);

        let mut total = 0;
        let mut items = Vec::new();
        for item in iter {
            if total >= offset && items.len() < limit {
                items.push(item);
            }
            total += 1;
        }

        Self {
            items,
            total,
            limit,
            offset,
        }
    }
}
