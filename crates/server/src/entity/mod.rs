pub mod openid_registration;
