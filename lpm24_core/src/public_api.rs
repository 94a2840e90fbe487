use crate::{
    errors::{map_error, set_last_error, Error, ErrorCode},
    LpmConfig, LpmTable,
};
use ipnet::Ipv4Net;
use std::{ffi::CStr, os::raw::c_char, ptr, sync::Arc};

/// Opaque handle: one strong reference to a table, owned by the caller.
pub type LpmHandle = *const LpmTable;

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::InvalidArgument);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

#[inline]
fn table<'a>(h: LpmHandle) -> Result<&'a LpmTable, ErrorCode> {
    unsafe { h.as_ref() }.ok_or(ErrorCode::InvalidHandle)
}

/// Record and return the code for `r`.
#[inline]
fn finish(r: Result<(), Error>) -> ErrorCode {
    let code = match r {
        Ok(()) => ErrorCode::Success,
        Err(e) => map_error(&e),
    };
    set_last_error(code);
    code
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => { set_last_error(e); return e }
}}}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create and register a table.
/// Returns `Success` **and** stores the handle in `*out`
/// -- or an error code otherwise.
#[no_mangle]
pub extern "C" fn lpm_create(
    name_utf8: *const c_char,
    max_rules: u32,
    number_groups: u32,
    out: *mut LpmHandle,
) -> ErrorCode {
    if out.is_null() {
        return finish(Err(Error::InvalidArgument("null out pointer")));
    }
    let name = try_c!(cstr(name_utf8));
    match LpmTable::create(name, LpmConfig::new(max_rules, number_groups)) {
        Ok(t) => {
            unsafe { *out = Arc::into_raw(t) };
            finish(Ok(()))
        }
        Err(e) => finish(Err(e)),
    }
}

/// A new handle to the table registered as `name`, or null with the reason
/// in `lpm_last_error`.
#[no_mangle]
pub extern "C" fn lpm_find_existing(name_utf8: *const c_char) -> LpmHandle {
    let name = match cstr(name_utf8) {
        Ok(n) => n,
        Err(e) => {
            set_last_error(e);
            return ptr::null();
        }
    };
    match LpmTable::find_existing(name) {
        Ok(t) => {
            set_last_error(ErrorCode::Success);
            Arc::into_raw(t)
        }
        Err(e) => {
            set_last_error(map_error(&e));
            ptr::null()
        }
    }
}

/// Drop one handle. The table stays registered.
#[no_mangle]
pub extern "C" fn lpm_close(h: LpmHandle) {
    if !h.is_null() {
        unsafe { drop(Arc::from_raw(h)) };
    }
}

/// Unregister the table and drop this handle. Null is ignored.
#[no_mangle]
pub extern "C" fn lpm_free(h: LpmHandle) {
    if !h.is_null() {
        unsafe { Arc::from_raw(h) }.free();
    }
}

// ───────────────────────── rules ─────────────────────────────────────── //

#[no_mangle]
pub extern "C" fn lpm_add(h: LpmHandle, ip: u32, depth: u8, next_hop: u32) -> ErrorCode {
    let t = try_c!(table(h));
    finish(t.add(ip, depth, next_hop).map(drop))
}

/// Add a rule given as `"a.b.c.d/n"`.
#[no_mangle]
pub extern "C" fn lpm_add_cidr(h: LpmHandle, cidr_utf8: *const c_char, next_hop: u32) -> ErrorCode {
    let t = try_c!(table(h));
    let cidr = try_c!(cstr(cidr_utf8));
    let net: Ipv4Net = try_c!(cidr.parse().map_err(|_| ErrorCode::InvalidArgument));
    finish(t.add_net(net, next_hop).map(drop))
}

#[no_mangle]
pub extern "C" fn lpm_delete(h: LpmHandle, ip: u32, depth: u8) -> ErrorCode {
    let t = try_c!(table(h));
    finish(t.delete(ip, depth))
}

#[no_mangle]
pub extern "C" fn lpm_delete_all(h: LpmHandle) -> ErrorCode {
    let t = try_c!(table(h));
    finish(t.delete_all())
}

#[no_mangle]
pub extern "C" fn lpm_is_rule_present(
    h: LpmHandle,
    ip: u32,
    depth: u8,
    out_next_hop: *mut u32,
    out_found: *mut bool,
) -> ErrorCode {
    if out_found.is_null() {
        return finish(Err(Error::InvalidArgument("null out pointer")));
    }
    let t = try_c!(table(h));
    let present = try_c!(t.is_rule_present(ip, depth).map_err(|e| map_error(&e)));
    unsafe {
        *out_found = present.is_some();
        if let (Some(nh), false) = (present, out_next_hop.is_null()) {
            *out_next_hop = nh;
        }
    }
    finish(Ok(()))
}

// ───────────────────────── lookup ────────────────────────────────────── //

/// `NotFound` when no rule covers `ip`. Does not touch `lpm_last_error`.
#[no_mangle]
pub extern "C" fn lpm_lookup(h: LpmHandle, ip: u32, out_next_hop: *mut u32) -> ErrorCode {
    if out_next_hop.is_null() {
        return ErrorCode::InvalidArgument;
    }
    let Some(t) = (unsafe { h.as_ref() }) else {
        return ErrorCode::InvalidHandle;
    };
    match t.lookup(ip) {
        Some(nh) => {
            unsafe { *out_next_hop = nh };
            ErrorCode::Success
        }
        None => ErrorCode::NotFound,
    }
}

/// Fill `out[i]` for every `ips[i]`; misses are written as `miss_value`.
#[no_mangle]
pub extern "C" fn lpm_lookup_bulk(
    h: LpmHandle,
    ips: *const u32,
    out: *mut u32,
    n: usize,
    miss_value: u32,
) -> ErrorCode {
    if n == 0 {
        return ErrorCode::Success;
    }
    if ips.is_null() || out.is_null() {
        return ErrorCode::InvalidArgument;
    }
    let Some(t) = (unsafe { h.as_ref() }) else {
        return ErrorCode::InvalidHandle;
    };
    let (ips, out) = unsafe {
        (
            std::slice::from_raw_parts(ips, n),
            std::slice::from_raw_parts_mut(out, n),
        )
    };
    for (ip, slot) in ips.iter().zip(out.iter_mut()) {
        *slot = t.lookup(*ip).unwrap_or(miss_value);
    }
    ErrorCode::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn c_round_trip() {
        let name = CString::new("c-abi-unit").unwrap();
        let mut h: LpmHandle = ptr::null();
        assert_eq!(lpm_create(name.as_ptr(), 16, 4, &mut h), ErrorCode::Success);
        assert!(!h.is_null());

        let cidr = CString::new("10.0.0.0/8").unwrap();
        assert_eq!(lpm_add_cidr(h, cidr.as_ptr(), 1), ErrorCode::Success);
        assert_eq!(lpm_add(h, 0x0A01_0000, 16, 2), ErrorCode::Success);
        assert_eq!(lpm_add(h, 0x0A01_0000, 0, 2), ErrorCode::InvalidArgument);
        assert_eq!(crate::errors::get_last_error(), ErrorCode::InvalidArgument);

        let mut nh = 0;
        assert_eq!(lpm_lookup(h, 0x0A01_0203, &mut nh), ErrorCode::Success);
        assert_eq!(nh, 2);
        assert_eq!(lpm_lookup(h, 0x0B00_0000, &mut nh), ErrorCode::NotFound);

        let (mut found, mut present_nh) = (false, 0);
        assert_eq!(
            lpm_is_rule_present(h, 0x0A00_0000, 8, &mut present_nh, &mut found),
            ErrorCode::Success
        );
        assert!(found);
        assert_eq!(present_nh, 1);

        let ips = [0x0A01_0203, 0x0A02_0000, 0x0B00_0000];
        let mut out = [0u32; 3];
        assert_eq!(
            lpm_lookup_bulk(h, ips.as_ptr(), out.as_mut_ptr(), 3, u32::MAX),
            ErrorCode::Success
        );
        assert_eq!(out, [2, 1, u32::MAX]);

        let again = lpm_find_existing(name.as_ptr());
        assert_eq!(again, h);
        lpm_close(again);

        assert_eq!(lpm_delete(h, 0x0A01_0000, 16), ErrorCode::Success);
        assert_eq!(lpm_delete(h, 0x0A01_0000, 16), ErrorCode::NotFound);
        assert_eq!(lpm_delete_all(h), ErrorCode::Success);
        assert_eq!(lpm_lookup(h, 0x0A01_0203, &mut nh), ErrorCode::NotFound);

        lpm_free(h);
        assert!(lpm_find_existing(name.as_ptr()).is_null());
        assert_eq!(crate::errors::get_last_error(), ErrorCode::NotFound);
    }

    #[test]
    fn null_out_pointers_set_last_error() {
        crate::errors::set_last_error(ErrorCode::Success);
        let name = CString::new("c-abi-null-out").unwrap();
        assert_eq!(
            lpm_create(name.as_ptr(), 4, 1, ptr::null_mut()),
            ErrorCode::InvalidArgument
        );
        assert_eq!(crate::errors::get_last_error(), ErrorCode::InvalidArgument);

        crate::errors::set_last_error(ErrorCode::Success);
        let mut nh = 0;
        assert_eq!(
            lpm_is_rule_present(ptr::null(), 0, 8, &mut nh, ptr::null_mut()),
            ErrorCode::InvalidArgument
        );
        assert_eq!(crate::errors::get_last_error(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn null_handles_are_rejected() {
        let mut nh = 0;
        assert_eq!(lpm_add(ptr::null(), 0, 8, 1), ErrorCode::InvalidHandle);
        assert_eq!(lpm_lookup(ptr::null(), 0, &mut nh), ErrorCode::InvalidHandle);
        lpm_free(ptr::null());
        lpm_close(ptr::null());
    }
}
