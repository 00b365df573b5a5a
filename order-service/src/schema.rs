diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        description -> Varchar,
        amount -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}
