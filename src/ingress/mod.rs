pub mod sv1_ingress;
