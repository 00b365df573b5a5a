use bigdecimal::BigDecimal;
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
#[diesel(table_name = crate::schema::accounts)]
pub struct Account {
    pub user_id: Uuid,
    pub balance: BigDecimal,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inbox)]
pub struct NewInboxEntry {
    pub message_id: String,
}
