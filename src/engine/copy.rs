//! Encoder for the Postgres binary `COPY` format.
//!
//! Layout: signature, flags and header extension length, then one tuple per
//! row (field count, then length-prefixed fields with `-1` for null), then a
//! `-1` field count as trailer. All integers are big-endian.

use rust_decimal::Decimal;

use crate::schema::{ProjectedRow, SqlValue};

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between the Unix epoch and the Postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const NUMERIC_POSITIVE: u16 = 0x0000;
const NUMERIC_NEGATIVE: u16 = 0x4000;

/// Encodes rows as a complete binary `COPY` payload: `Id` followed by the data columns.
pub fn encode_rows(rows: &[ProjectedRow]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(19 + rows.len() * 64);
    buf.extend_from_slice(SIGNATURE);
    buf.extend_from_slice(&0i32.to_be_bytes());
    buf.extend_from_slice(&0i32.to_be_bytes());

    for row in rows {
        let fields = (row.values.len() + 1) as i16;
        buf.extend_from_slice(&fields.to_be_bytes());
        write_field(&mut buf, row.id.as_bytes());
        for value in &row.values {
            encode_value(&mut buf, value);
        }
    }

    buf.extend_from_slice(&(-1i16).to_be_bytes());
    buf
}

fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn encode_value(buf: &mut Vec<u8>, value: &SqlValue) {
    match value {
        SqlValue::Null => buf.extend_from_slice(&(-1i32).to_be_bytes()),
        SqlValue::Bool(b) => write_field(buf, &[u8::from(*b)]),
        SqlValue::Int(i) => write_field(buf, &i.to_be_bytes()),
        SqlValue::BigInt(i) => write_field(buf, &i.to_be_bytes()),
        SqlValue::Double(f) => write_field(buf, &f.to_be_bytes()),
        SqlValue::Text(s) => write_field(buf, s.as_bytes()),
        SqlValue::Uuid(u) => write_field(buf, u.as_bytes()),
        SqlValue::Timestamp(t) => {
            let micros = t.timestamp_micros() - PG_EPOCH_OFFSET_MICROS;
            write_field(buf, &micros.to_be_bytes())
        }
        SqlValue::Decimal(d) => write_field(buf, &encode_numeric(d)),
    }
}

/// Postgres `numeric` wire form: digit count, weight, sign, display scale,
/// then base-10000 digits.
fn encode_numeric(value: &Decimal) -> Vec<u8> {
    let scale = value.scale() as usize;
    let mut digits = value.mantissa().unsigned_abs().to_string();
    if digits.len() <= scale {
        digits = format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits);
    }
    let (int_part, frac_part) = digits.split_at(digits.len() - scale);

    // Align both parts on 4-digit group boundaries around the decimal point.
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let aligned = format!(
        "{}{}{}{}",
        "0".repeat(int_pad),
        int_part,
        frac_part,
        "0".repeat(frac_pad)
    );

    let mut groups: Vec<i16> = aligned
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0'))
        })
        .collect();
    let mut weight = ((int_pad + int_part.len()) / 4) as i16 - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i16;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let sign = if groups.is_empty() {
        weight = 0;
        NUMERIC_POSITIVE
    } else if value.is_sign_negative() {
        NUMERIC_NEGATIVE
    } else {
        NUMERIC_POSITIVE
    };

    let mut out = Vec::with_capacity(8 + groups.len() * 2);
    out.extend_from_slice(&(groups.len() as i16).to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&(scale as u16).to_be_bytes());
    for group in groups {
        out.extend_from_slice(&group.to_be_bytes());
    }
    out
}
