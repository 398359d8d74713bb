//! The `crypto` global: `randomUUID`, random bytes, and `crypto.subtle`
//! digest/sign/verify (SHA-1/256/384/512, HMAC).

use hmac::Mac;
use rquickjs::object::Property;
use rquickjs::{Ctx, Exception, Function, Object, Promise, Result, TypedArray, Value};
use sha1::Sha1;
use sha2::digest::{Digest, FixedOutputReset};
use sha2::{Sha256, Sha384, Sha512};

use crate::utils::{as_bytes, bytes_to_array_buffer, resolved_promise};

trait DynHash {
    fn update(&mut self, data: &[u8]);
    fn finalize(&mut self) -> Vec<u8>;
}

impl<T: Digest + FixedOutputReset> DynHash for T {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data)
    }

    fn finalize(&mut self) -> Vec<u8> {
        Digest::finalize_reset(self).to_vec()
    }
}

/// Accepts `"SHA-256"` or `{ name: "SHA-256" }`.
fn algorithm_name<'js>(ctx: &Ctx<'js>, algorithm: &Value<'js>) -> Result<String> {
    if let Some(name) = algorithm.as_string() {
        return Ok(name.to_string()?);
    }
    if let Some(obj) = algorithm.as_object() {
        if let Some(name) = obj.get::<_, Option<String>>("name").ok().flatten() {
            return Ok(name);
        }
    }
    Err(Exception::throw_type(
        ctx,
        "algorithm must be a string or an object with a name",
    ))
}

fn hasher_for(ctx: &Ctx<'_>, name: &str) -> Result<Box<dyn DynHash>> {
    match name.to_ascii_uppercase().as_str() {
        "SHA-1" => Ok(Box::new(Sha1::new())),
        "SHA-256" => Ok(Box::new(Sha256::new())),
        "SHA-384" => Ok(Box::new(Sha384::new())),
        "SHA-512" => Ok(Box::new(Sha512::new())),
        other => Err(Exception::throw_type(
            ctx,
            &format!("unsupported digest algorithm {other:?}"),
        )),
    }
}

fn digest<'js>(ctx: Ctx<'js>, algorithm: Value<'js>, data: Value<'js>) -> Result<Promise<'js>> {
    let name = algorithm_name(&ctx, &algorithm)?;
    let mut hasher = hasher_for(&ctx, &name)?;
    hasher.update(&as_bytes(data)?);
    let buffer = bytes_to_array_buffer(&ctx, &hasher.finalize())?;
    resolved_promise(&ctx, buffer)
}

/// The hash behind an HMAC algorithm value: SHA-256 unless
/// `{ name: "HMAC", hash }` says otherwise.
fn hmac_hash_name<'js>(ctx: &Ctx<'js>, algorithm: &Value<'js>) -> Result<String> {
    let name = algorithm_name(ctx, algorithm)?;
    if name.to_ascii_uppercase() != "HMAC" {
        return Err(Exception::throw_type(
            ctx,
            &format!("unsupported sign/verify algorithm {name:?}"),
        ));
    }
    if let Some(obj) = algorithm.as_object() {
        if let Some(hash) = obj.get::<_, Option<Value>>("hash").ok().flatten() {
            if !hash.is_undefined() && !hash.is_null() {
                return algorithm_name(ctx, &hash);
            }
        }
    }
    Ok("SHA-256".to_string())
}

fn hmac_sign(ctx: &Ctx<'_>, hash: &str, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    macro_rules! sign_with {
        ($hash:ty) => {{
            let mut mac = <hmac::Hmac<$hash> as hmac::digest::KeyInit>::new_from_slice(key)
                .map_err(|e| Exception::throw_type(ctx, &format!("invalid HMAC key: {e}")))?;
            Mac::update(&mut mac, data);
            Ok(mac.finalize().into_bytes().to_vec())
        }};
    }
    match hash.to_ascii_uppercase().as_str() {
        "SHA-256" => sign_with!(Sha256),
        "SHA-384" => sign_with!(Sha384),
        "SHA-512" => sign_with!(Sha512),
        other => Err(Exception::throw_type(
            ctx,
            &format!("unsupported HMAC hash {other:?}"),
        )),
    }
}

/// Constant-time comparison via the Mac verifier.
fn hmac_verify(ctx: &Ctx<'_>, hash: &str, key: &[u8], signature: &[u8], data: &[u8]) -> Result<bool> {
    macro_rules! verify_with {
        ($hash:ty) => {{
            let mut mac = <hmac::Hmac<$hash> as hmac::digest::KeyInit>::new_from_slice(key)
                .map_err(|e| Exception::throw_type(ctx, &format!("invalid HMAC key: {e}")))?;
            Mac::update(&mut mac, data);
            Ok(mac.verify_slice(signature).is_ok())
        }};
    }
    match hash.to_ascii_uppercase().as_str() {
        "SHA-256" => verify_with!(Sha256),
        "SHA-384" => verify_with!(Sha384),
        "SHA-512" => verify_with!(Sha512),
        other => Err(Exception::throw_type(
            ctx,
            &format!("unsupported HMAC hash {other:?}"),
        )),
    }
}

fn sign<'js>(
    ctx: Ctx<'js>,
    algorithm: Value<'js>,
    key: Value<'js>,
    data: Value<'js>,
) -> Result<Promise<'js>> {
    let hash = hmac_hash_name(&ctx, &algorithm)?;
    let signature = hmac_sign(&ctx, &hash, &as_bytes(key)?, &as_bytes(data)?)?;
    let buffer = bytes_to_array_buffer(&ctx, &signature)?;
    resolved_promise(&ctx, buffer)
}

fn verify<'js>(
    ctx: Ctx<'js>,
    algorithm: Value<'js>,
    key: Value<'js>,
    signature: Value<'js>,
    data: Value<'js>,
) -> Result<Promise<'js>> {
    let hash = hmac_hash_name(&ctx, &algorithm)?;
    let valid = hmac_verify(
        &ctx,
        &hash,
        &as_bytes(key)?,
        &as_bytes(signature)?,
        &as_bytes(data)?,
    )?;
    resolved_promise(&ctx, valid)
}

fn random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn random_bytes(ctx: Ctx<'_>, length: f64) -> Result<TypedArray<'_, u8>> {
    let length = length.max(0.0) as usize;
    if length > 65536 {
        return Err(Exception::throw_message(
            &ctx,
            "getRandomValues: requested more than 65536 bytes",
        ));
    }
    let mut buffer = vec![0u8; length];
    getrandom::getrandom(&mut buffer)
        .map_err(|e| Exception::throw_internal(&ctx, &format!("entropy source failed: {e}")))?;
    TypedArray::new(ctx, buffer)
}

pub fn setup<'a>(ctx: &Ctx<'a>, globals: &Object<'a>) -> Result<()> {
    let subtle = Object::new(ctx.clone())?;
    subtle.set("digest", Function::new(ctx.clone(), digest)?.with_name("digest")?)?;
    subtle.set("sign", Function::new(ctx.clone(), sign)?.with_name("sign")?)?;
    subtle.set("verify", Function::new(ctx.clone(), verify)?.with_name("verify")?)?;

    let crypto = Object::new(ctx.clone())?;
    crypto.set(
        "randomUUID",
        Function::new(ctx.clone(), random_uuid)?.with_name("randomUUID")?,
    )?;
    crypto.set("subtle", subtle)?;

    globals.set(
        "__nanoRandomBytes",
        Function::new(ctx.clone(), random_bytes)?.with_name("__nanoRandomBytes")?,
    )?;
    globals.prop("crypto", Property::from(crypto))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use hmac::Mac;
    use sha2::Sha256;

    #[test]
    fn hmac_sign_verify_round_trip() {
        let key = b"a-signing-key";
        let message = b"payload";
        let mut mac = <hmac::Hmac<Sha256> as hmac::digest::KeyInit>::new_from_slice(key).unwrap();
        Mac::update(&mut mac, message);
        let tag = mac.finalize().into_bytes();

        let mut verifier =
            <hmac::Hmac<Sha256> as hmac::digest::KeyInit>::new_from_slice(key).unwrap();
        Mac::update(&mut verifier, message);
        assert!(verifier.verify_slice(&tag).is_ok());

        let mut tampered =
            <hmac::Hmac<Sha256> as hmac::digest::KeyInit>::new_from_slice(key).unwrap();
        Mac::update(&mut tampered, b"other payload");
        assert!(tampered.verify_slice(&tag).is_err());
    }
}
