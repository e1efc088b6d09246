// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Conversion of configuration-level JSON arguments into AMQP field tables.

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde_json::Value;
use std::collections::BTreeMap;

pub(crate) fn field_table(args: &BTreeMap<String, Value>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in args {
        btree.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    FieldTable::from(btree)
}

pub(crate) fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => AMQPValue::LongLongInt(v),
            (None, Some(v)) => AMQPValue::Double(v),
            _ => AMQPValue::Void,
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
            for (key, value) in map {
                btree.insert(ShortString::from(key.clone()), amqp_value(value));
            }
            AMQPValue::FieldTable(FieldTable::from(btree))
        }
    }
}
