use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_instant(ms: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

fn validate_criterion(value: &str) -> Result<(), EngineError> {
    if value.len() > MAX_CRITERION_LEN {
        return Err(EngineError::LimitExceeded("criterion too long"));
    }
    Ok(())
}

pub(crate) fn validate_filter(filter: &SlotFilter) -> Result<(), EngineError> {
    if filter.products.len() > MAX_PRODUCTS_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many products"));
    }
    validate_criterion(&filter.language)?;
    validate_criterion(&filter.rating)?;
    for product in &filter.products {
        validate_criterion(product)?;
    }
    validate_instant(filter.day_span().start)
}

pub(crate) fn validate_request(request: &BookingRequest) -> Result<(), EngineError> {
    validate_filter(&request.criteria)?;
    validate_instant(request.desired_start)
}

pub(crate) fn validate_manager(manager: &SalesManager) -> Result<(), EngineError> {
    if manager.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    for tags in [&manager.languages, &manager.products, &manager.customer_ratings] {
        if tags.len() > MAX_TAGS_PER_MANAGER {
            return Err(EngineError::LimitExceeded("too many tags"));
        }
        for tag in tags {
            validate_criterion(tag)?;
        }
    }
    Ok(())
}

pub(crate) fn validate_batch<T>(rows: &[T]) -> Result<(), EngineError> {
    if rows.len() > MAX_BATCH_SIZE {
        return Err(EngineError::LimitExceeded("batch too large"));
    }
    Ok(())
}
