use lapin::{types::AMQPValue, BasicProperties};
use std::borrow::{Borrow, Cow};

/// Header carrying how many times a message has already been retried.
///
/// A missing header means the message is on its first attempt.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }

    /// The value of the [`RETRY_COUNT_HEADER`] header.
    ///
    /// Any integer type is accepted, as well as strings holding a number, since publishers
    /// written against other client libraries pick different encodings.
    /// Missing, negative or unparsable values count as `0`.
    fn retry_count(&self) -> u32 {
        let Some(value) = self.get_header(RETRY_COUNT_HEADER) else {
            return 0;
        };
        let count: Option<i64> = match value {
            AMQPValue::ShortShortInt(v) => Some((*v).into()),
            AMQPValue::ShortShortUInt(v) => Some((*v).into()),
            AMQPValue::ShortInt(v) => Some((*v).into()),
            AMQPValue::ShortUInt(v) => Some((*v).into()),
            AMQPValue::LongInt(v) => Some((*v).into()),
            AMQPValue::LongUInt(v) => Some((*v).into()),
            AMQPValue::LongLongInt(v) => Some(*v),
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).trim().parse().ok(),
            AMQPValue::ShortString(s) => s.as_str().trim().parse().ok(),
            _ => None,
        };
        count
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or_default()
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// # Implementation notes
///
/// `lapin` does not give mutable access to the headers of `BasicProperties`, so all headers are
/// cloned. We consume the `properties` input to make sure the caller does not re-use it under the
/// impression that it has been mutated to add the new header.
///
/// # Example
///
/// ```rust
/// use burrow::amqp::types::{AMQPValue, ShortString};
/// use burrow::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = BasicProperties::default();
///
/// let header_name = "MyHeaderName";
/// let header_value = AMQPValue::LongString(header_name.into());
///
/// let properties = set_header(properties, header_name, header_value.clone());
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = header_name.into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}

/// Copy of `properties` whose [`RETRY_COUNT_HEADER`] is set to `retry_count`.
pub fn with_retry_count(properties: BasicProperties, retry_count: u32) -> BasicProperties {
    set_header(
        properties,
        RETRY_COUNT_HEADER,
        AMQPValue::LongLongInt(retry_count.into()),
    )
}
