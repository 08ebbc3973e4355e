diesel::table! {
    cart_items (id) {
        id -> Uuid,
        owner_id -> Uuid,
        subject_type -> Varchar,
        subject_id -> Uuid,
        quantity -> Int4,
        reservation_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    inventory (subject_id) {
        subject_id -> Uuid,
        subject_type -> Varchar,
        quantity_on_hand -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_lines (id) {
        id -> Uuid,
        order_id -> Uuid,
        reservation_id -> Uuid,
        subject_type -> Varchar,
        subject_id -> Uuid,
        quantity -> Int4,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        owner_id -> Uuid,
        status -> Varchar,
        payment_deadline -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        subject_type -> Varchar,
        subject_id -> Uuid,
        owner_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        expires_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(order_lines -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    cart_items,
    inventory,
    order_lines,
    orders,
    reservations,
);
