diesel::table! {
    flash_sales (id) {
        id -> Uuid,
        product_id -> Uuid,
        product_name -> Varchar,
        name -> Varchar,
        description -> Nullable<Text>,
        original_price -> Numeric,
        flash_price -> Numeric,
        total_quantity -> Numeric,
        sold_quantity -> Numeric,
        reserved_quantity -> Numeric,
        max_per_user -> Numeric,
        min_purchase -> Numeric,
        start_time -> Timestamptz,
        end_time -> Timestamptz,
        status -> Varchar,
        priority -> Int4,
        is_featured -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        sale_id -> Uuid,
        customer_id -> Uuid,
        quantity -> Numeric,
        status -> Varchar,
        expires_at -> Timestamptz,
        converted_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    flash_sale_orders (id) {
        id -> Uuid,
        order_code -> Varchar,
        sale_id -> Uuid,
        reservation_id -> Uuid,
        customer_id -> Uuid,
        quantity -> Numeric,
        unit_price -> Numeric,
        total_amount -> Numeric,
        discount_amount -> Numeric,
        status -> Varchar,
        payment_method -> Nullable<Varchar>,
        payment_deadline -> Timestamptz,
        paid_at -> Nullable<Timestamptz>,
        shipping_name -> Nullable<Varchar>,
        shipping_phone -> Nullable<Varchar>,
        shipping_address -> Nullable<Text>,
        customer_note -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        attempts -> Int4,
        next_attempt_at -> Timestamptz,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_dead_letters (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        attempts -> Int4,
        last_error -> Nullable<Text>,
        failed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    flash_sales,
    reservations,
    flash_sale_orders,
    outbox_events,
    outbox_dead_letters,
);
