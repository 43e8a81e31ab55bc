pub mod s390x;
