diesel::table! {
    accounts (user_id) {
        user_id -> Uuid,
        balance -> Numeric,
    }
}

diesel::table! {
    inbox (message_id) {
        message_id -> Varchar,
        processed -> Bool,
        received_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(accounts, inbox);
